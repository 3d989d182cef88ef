use ndarray::{Array2, ArrayView4};

use crate::Result;

/// Whether a forward pass is part of training or inference.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Mode {
    /// Batch statistics are used and every layer keeps what its backward pass needs.
    #[default]
    Train,
    /// Running statistics are used and nothing is cached.
    Eval,
}

pub trait Model {
    /// Returns the amount of parameters in the model.
    fn size(&self) -> usize;

    /// Switches the mode used by subsequent forward passes.
    fn set_mode(&mut self, mode: Mode);

    /// Makes a forward pass through the network.
    ///
    /// # Arguments
    /// * `params` - The model's parameters.
    /// * `x` - A batch of images with shape `(n, c, h, w)`.
    ///
    /// # Returns
    /// The logits with shape `(n, classes)` or an error if occurred.
    fn forward(&mut self, params: &[f32], x: ArrayView4<f32>) -> Result<Array2<f32>>;
}
