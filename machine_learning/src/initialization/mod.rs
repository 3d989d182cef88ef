mod random;

pub use random::RandWeightGen;

/// Generates the initial values of a parameter slice.
pub trait WeightGen {
    /// Samples at most `n` values, `None` when the generator is exhausted.
    fn sample(&mut self, n: usize) -> Option<Vec<f32>>;
}
