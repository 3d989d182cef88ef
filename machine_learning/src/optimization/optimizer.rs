use crate::Result;

pub trait Optimizer {
    /// Applies one update step to `params` given their gradient.
    ///
    /// # Errors
    /// `MlErr::SizeMismatch` if the buffers don't have the same length as the optimizer state.
    fn update_params(&mut self, grad: &[f32], params: &mut [f32]) -> Result<()>;
}
