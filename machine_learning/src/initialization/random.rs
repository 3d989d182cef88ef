use std::{cell::RefCell, rc::Rc};

use rand::Rng;
use rand_distr::{Distribution, Normal, Uniform};

use super::WeightGen;
use crate::Result;

/// A weight generator that follows a certain probabilistic distribution.
pub struct RandWeightGen<R: Rng, D: Distribution<f32>> {
    rng: Rc<RefCell<R>>,
    distribution: D,
    remaining: usize,
}

impl<R: Rng, D: Distribution<f32>> RandWeightGen<R, D> {
    /// Creates a new `RandWeightGen` weight generator.
    ///
    /// # Arguments
    /// * `rng` - A random number generator.
    /// * `distribution` - The distribution to sample the random numbers from.
    /// * `limit` - The maximum amount of numbers to generate.
    pub fn new(rng: Rc<RefCell<R>>, distribution: D, limit: usize) -> Self {
        Self {
            rng,
            distribution,
            remaining: limit,
        }
    }

    /// Fills the whole `out` slice with samples, the slice must not exceed the generator's limit.
    ///
    /// # Arguments
    /// * `out` - The parameter slice to overwrite.
    pub fn fill(&mut self, out: &mut [f32]) {
        let n = out.len().min(self.remaining);
        self.remaining -= n;

        let mut rng = self.rng.borrow_mut();
        out[..n]
            .iter_mut()
            .for_each(|w| *w = self.distribution.sample(&mut *rng));
    }
}

impl<R: Rng> RandWeightGen<R, Uniform<f32>> {
    /// Creates a new `RandWeightGen` weight generator with a uniform distribution.
    ///
    /// # Arguments
    /// * `rng` - A random number generator.
    /// * `limit` - The maximum amount of numbers to generate.
    /// * `low` - The inclusive lower limit.
    /// * `high` - The exclusive upper limit.
    ///
    /// # Returns
    /// An error if the range is invalid (low >= high).
    pub fn uniform(rng: Rc<RefCell<R>>, limit: usize, low: f32, high: f32) -> Result<Self> {
        Ok(Self::new(rng, Uniform::new(low, high)?, limit))
    }

    /// Creates a new `RandWeightGen` weight generator for a fully connected layer, sampling
    /// from `U(-1/sqrt(fan_in), 1/sqrt(fan_in))`.
    ///
    /// # Arguments
    /// * `rng` - A random number generator.
    /// * `limit` - The maximum amount of numbers to generate.
    /// * `fan_in` - The number of input units in the weight tensor.
    pub fn fan_in_uniform(rng: Rc<RefCell<R>>, limit: usize, fan_in: usize) -> Result<Self> {
        let range = 1. / (fan_in.max(1) as f32).sqrt();
        Self::uniform(rng, limit, -range, range)
    }
}

impl<R: Rng> RandWeightGen<R, Normal<f32>> {
    /// Creates a new `RandWeightGen` weight generator with a normal distribution.
    ///
    /// # Arguments
    /// * `rng` - A random number generator.
    /// * `limit` - The maximum amount of numbers to generate.
    /// * `mean` - The mean of the distribution.
    /// * `std_dev` - The standard deviation of the distribution.
    ///
    /// # Returns
    /// An error if `std_dev` is not finite (Nan or infinite).
    pub fn normal(rng: Rc<RefCell<R>>, limit: usize, mean: f32, std_dev: f32) -> Result<Self> {
        Ok(Self::new(rng, Normal::new(mean, std_dev)?, limit))
    }

    /// Creates a new `RandWeightGen` weight generator using Kaiming normal initialization.
    ///
    /// # Arguments
    /// * `rng` - A random number generator.
    /// * `limit` - The maximum amount of numbers to generate.
    /// * `fan` - The number of units the variance is preserved for.
    ///
    /// # Returns
    /// An error if the calculated standard deviation is not finite (Nan or infinite).
    pub fn kaiming(rng: Rc<RefCell<R>>, limit: usize, fan: usize) -> Result<Self> {
        let std_dev = (2. / fan as f32).sqrt();
        Self::normal(rng, limit, 0., std_dev)
    }
}

impl<R: Rng, D: Distribution<f32>> WeightGen for RandWeightGen<R, D> {
    fn sample(&mut self, mut n: usize) -> Option<Vec<f32>> {
        if self.remaining == 0 {
            return None;
        }

        n = n.min(self.remaining);
        self.remaining -= n;

        let mut rng = self.rng.borrow_mut();
        let sample = (0..n).map(|_| self.distribution.sample(&mut *rng)).collect();
        Some(sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn seeded_rng() -> Rc<RefCell<StdRng>> {
        Rc::new(RefCell::new(StdRng::seed_from_u64(42)))
    }

    #[test]
    fn empty() {
        let mut weight_gen = RandWeightGen::normal(seeded_rng(), 0, 0., 1.).unwrap();
        assert!(weight_gen.sample(1).is_none());
    }

    #[test]
    fn partial() {
        let mut weight_gen = RandWeightGen::normal(seeded_rng(), 10, 0., 1.).unwrap();

        assert_eq!(weight_gen.sample(7).unwrap().len(), 7);
        assert_eq!(weight_gen.sample(7).unwrap().len(), 3);
        assert!(weight_gen.sample(1).is_none());
    }

    #[test]
    fn fan_in_uniform_stays_in_range() {
        let mut weight_gen = RandWeightGen::fan_in_uniform(seeded_rng(), 100, 16).unwrap();
        let mut out = [0.; 100];
        weight_gen.fill(&mut out);

        assert!(out.iter().all(|w| w.abs() <= 0.25));
        assert!(out.iter().any(|&w| w != 0.));
    }

    #[test]
    fn normal_rejects_negative_std_dev() {
        assert!(RandWeightGen::normal(seeded_rng(), 10, 0., -1.).is_err());
    }

    #[test]
    fn same_seed_same_weights() {
        let mut a = [0.; 8];
        let mut b = [0.; 8];
        RandWeightGen::kaiming(seeded_rng(), 8, 4).unwrap().fill(&mut a);
        RandWeightGen::kaiming(seeded_rng(), 8, 4).unwrap().fill(&mut b);
        assert_eq!(a, b);
    }
}
