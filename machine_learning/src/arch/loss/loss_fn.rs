use ndarray::{Array2, ArrayView2};

use crate::Result;

pub trait LossFn {
    /// The mean loss of a batch of logits against their class labels.
    fn loss(&self, logits: ArrayView2<f32>, labels: &[usize]) -> Result<f32>;

    /// The derivative of `loss` with respect to the logits.
    fn loss_prime(&self, logits: ArrayView2<f32>, labels: &[usize]) -> Result<Array2<f32>>;
}
