use serde::{Deserialize, Serialize};

use super::Optimizer;
use crate::{MlErr, Result};

/// The scalar part of the Adam state, the moments are kept apart since they are as large as the
/// model itself.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdamScalars {
    pub learning_rate: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub beta1_t: f32,
    pub beta2_t: f32,
    pub epsilon: f32,
}

#[derive(Debug)]
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    beta1_t: f32,
    beta2_t: f32,
    v: Box<[f32]>,
    s: Box<[f32]>,
    epsilon: f32,
}

impl Adam {
    pub const BETA1: f32 = 0.9;
    pub const BETA2: f32 = 0.999;
    pub const EPSILON: f32 = 1e-8;

    /// Creates a new `Adam` optimizer.
    ///
    /// # Arguments
    /// * `len` - The amount of parameters this instance should hold.
    /// * `learning_rate` - The small coefficient that modulates the amount of training per update.
    /// * `beta1`, `beta2`, `epsilon` - Hyperparameters to the optimization algorithm.
    ///
    /// # Returns
    /// A new `Adam` instance.
    pub fn new(len: usize, learning_rate: f32, beta1: f32, beta2: f32, epsilon: f32) -> Self {
        Self {
            learning_rate,
            beta1,
            beta2,
            beta1_t: 1.,
            beta2_t: 1.,
            v: vec![0.; len].into_boxed_slice(),
            s: vec![0.; len].into_boxed_slice(),
            epsilon,
        }
    }

    /// Creates a new `Adam` optimizer with the usual `0.9`, `0.999` and `1e-8` hyperparameters.
    pub fn with_learning_rate(len: usize, learning_rate: f32) -> Self {
        Self::new(len, learning_rate, Self::BETA1, Self::BETA2, Self::EPSILON)
    }

    /// Rebuilds an optimizer from a saved state.
    ///
    /// # Errors
    /// `MlErr::SizeMismatch` if the moments don't have the same length.
    pub fn from_parts(scalars: AdamScalars, v: Vec<f32>, s: Vec<f32>) -> Result<Self> {
        if v.len() != s.len() {
            return Err(MlErr::SizeMismatch {
                a: "first moment",
                b: "second moment",
                got: s.len(),
                expected: v.len(),
            });
        }

        let AdamScalars {
            learning_rate,
            beta1,
            beta2,
            beta1_t,
            beta2_t,
            epsilon,
        } = scalars;

        Ok(Self {
            learning_rate,
            beta1,
            beta2,
            beta1_t,
            beta2_t,
            v: v.into_boxed_slice(),
            s: s.into_boxed_slice(),
            epsilon,
        })
    }

    pub fn scalars(&self) -> AdamScalars {
        AdamScalars {
            learning_rate: self.learning_rate,
            beta1: self.beta1,
            beta2: self.beta2,
            beta1_t: self.beta1_t,
            beta2_t: self.beta2_t,
            epsilon: self.epsilon,
        }
    }

    /// The first and second moment estimates.
    pub fn moments(&self) -> (&[f32], &[f32]) {
        (&self.v, &self.s)
    }

    pub fn len(&self) -> usize {
        self.v.len()
    }

    pub fn is_empty(&self) -> bool {
        self.v.is_empty()
    }
}

impl Optimizer for Adam {
    fn update_params(&mut self, grad: &[f32], params: &mut [f32]) -> Result<()> {
        for (what, got) in [("grad", grad.len()), ("params", params.len())] {
            if got != self.v.len() {
                return Err(MlErr::SizeMismatch {
                    a: what,
                    b: "optimizer state",
                    got,
                    expected: self.v.len(),
                });
            }
        }

        let Self {
            learning_rate: lr,
            beta1: b1,
            beta2: b2,
            epsilon: eps,
            ..
        } = *self;

        self.beta1_t *= b1;
        self.beta2_t *= b2;

        let bc1 = 1. - self.beta1_t;
        let bc2 = 1. - self.beta2_t;
        let step_size = lr * (bc2.sqrt() / bc1);

        params
            .iter_mut()
            .zip(grad)
            .zip(self.v.iter_mut())
            .zip(self.s.iter_mut())
            .for_each(|(((p, g), v), s)| {
                *v = b1 * *v + (1. - b1) * g;
                *s = b2 * *s + (1. - b2) * g.powi(2);
                *p -= step_size * *v / (s.sqrt() + eps);
            });

        Ok(())
    }
}
