use std::{cell::RefCell, rc::Rc};

use ndarray::{Array4, ArrayView4};
use rand::Rng;

use super::{Mode, layers::Conv2d};
use crate::{MlErr, Result, initialization::RandWeightGen};

/// A fixed random 3x3 convolution used to simulate a shifted input domain.
///
/// The kernel is the identity plus `N(0, lambd)` noise on every weight, so `lambd = 0` leaves
/// the images untouched. It has no trainable parameters.
pub struct DistortionModelConv {
    conv: Conv2d,
    params: Vec<f32>,
    input_shape: (usize, usize, usize, usize),
}

impl DistortionModelConv {
    /// Creates a new `DistortionModelConv`.
    ///
    /// # Arguments
    /// * `input_shape` - The `(n, c, h, w)` shape of the batches it will distort.
    /// * `lambd` - The standard deviation of the noise added to the identity kernel.
    /// * `rng` - A random number generator.
    ///
    /// # Returns
    /// An error if `lambd` is not a valid standard deviation.
    pub fn new<R: Rng>(
        input_shape: (usize, usize, usize, usize),
        lambd: f32,
        rng: Rc<RefCell<R>>,
    ) -> Result<Self> {
        let channels = input_shape.1;
        let conv = Conv2d::new(channels, channels, 3, 1, 1, 0);

        let mut params = vec![0.; conv.size()];
        RandWeightGen::normal(rng, conv.size(), 0., lambd)?.fill(&mut params);

        // Center tap of the kernel mapping every channel to itself.
        for c in 0..channels {
            params[(c * channels + c) * 9 + 4] += 1.;
        }

        Ok(Self {
            conv,
            params,
            input_shape,
        })
    }

    pub fn input_shape(&self) -> (usize, usize, usize, usize) {
        self.input_shape
    }

    /// Distorts a batch, the batch size and spatial size may differ from the construction shape.
    pub fn apply(&mut self, x: ArrayView4<f32>) -> Result<Array4<f32>> {
        let channels = x.dim().1;
        if channels != self.input_shape.1 {
            return Err(MlErr::SizeMismatch {
                a: "distortion input channels",
                b: "distortion kernel",
                got: channels,
                expected: self.input_shape.1,
            });
        }

        self.conv.forward(&self.params, x, Mode::Eval)
    }
}

#[cfg(test)]
mod tests {
    use ndarray::Array;
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;

    fn seeded_rng() -> Rc<RefCell<StdRng>> {
        Rc::new(RefCell::new(StdRng::seed_from_u64(3)))
    }

    fn batch() -> Array4<f32> {
        Array::from_shape_fn((2, 3, 4, 4), |(n, c, i, j)| (n + 2 * c + i * j) as f32 / 10.)
    }

    #[test]
    fn zero_lambda_is_identity() {
        let x = batch();
        let mut distortion = DistortionModelConv::new(x.dim(), 0., seeded_rng()).unwrap();

        let y = distortion.apply(x.view()).unwrap();

        assert!(y.iter().zip(&x).all(|(a, b)| (a - b).abs() < 1e-6));
    }

    #[test]
    fn noise_changes_the_image_but_keeps_its_shape() {
        let x = batch();
        let mut distortion = DistortionModelConv::new(x.dim(), 0.1, seeded_rng()).unwrap();

        let y = distortion.apply(x.view()).unwrap();

        assert_eq!(distortion.input_shape(), x.dim());
        assert_eq!(y.dim(), x.dim());
        assert!(y.iter().zip(&x).any(|(a, b)| (a - b).abs() > 1e-4));
    }

    #[test]
    fn rejects_other_channel_counts() {
        let mut distortion = DistortionModelConv::new((1, 3, 4, 4), 0.1, seeded_rng()).unwrap();
        assert!(distortion.apply(Array4::zeros((1, 1, 4, 4)).view()).is_err());
    }
}
