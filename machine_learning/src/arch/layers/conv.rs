use std::{cell::RefCell, rc::Rc};

use ndarray::{
    Array2, Array3, Array4, ArrayView2, ArrayView3, ArrayView4, ArrayViewMut2, ArrayViewMut3, Axis,
    linalg,
};
use rand::Rng;
use rayon::prelude::*;

use crate::{MlErr, Result, arch::Mode, initialization::RandWeightGen};

/// A bias-free 2D convolution over `NCHW` tensors, computed as an im2col matrix product per sample.
///
/// The weights live in the model's flat parameter buffer at `offset`, laid out as
/// `(out_channels, in_channels, kernel, kernel)`.
#[derive(Debug)]
pub struct Conv2d {
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
    offset: usize,

    // Forward metadata
    x: Option<Array4<f32>>,
}

impl Conv2d {
    /// Creates a new `Conv2d` layer.
    ///
    /// # Arguments
    /// * `in_channels` - The amount of input feature maps.
    /// * `out_channels` - The amount of output feature maps.
    /// * `kernel` - The side of the square kernel.
    /// * `stride` - The step between consecutive kernel applications.
    /// * `padding` - The amount of zeros added on every side of the input.
    /// * `offset` - The position of this layer's weights in the flat parameter buffer.
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        padding: usize,
        offset: usize,
    ) -> Self {
        Self {
            in_channels,
            out_channels,
            kernel,
            stride,
            padding,
            offset,
            x: None,
        }
    }

    /// Returns the amount of parameters this layer has.
    pub fn size(&self) -> usize {
        self.out_channels * self.in_channels * self.kernel * self.kernel
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    /// Returns the spatial dimensions of the output for an input of `h` by `w`.
    pub fn output_dim(&self, h: usize, w: usize) -> (usize, usize) {
        let span = |n: usize| (n + 2 * self.padding).saturating_sub(self.kernel) / self.stride + 1;
        (span(h), span(w))
    }

    /// Writes Kaiming normal weights (fan out mode) into this layer's slice of `params`.
    pub fn init<R: Rng>(&self, params: &mut [f32], rng: Rc<RefCell<R>>) -> Result<()> {
        let fan_out = self.out_channels * self.kernel * self.kernel;
        let mut weight_gen = RandWeightGen::kaiming(rng, self.size(), fan_out)?;
        weight_gen.fill(&mut params[self.offset..self.offset + self.size()]);
        Ok(())
    }

    /// Convolves `x` with this layer's weights.
    ///
    /// # Arguments
    /// * `params` - The model's parameters.
    /// * `x` - The input tensor with shape `(n, in_channels, h, w)`.
    /// * `mode` - In `Mode::Train` the input is kept for the backward pass.
    ///
    /// # Returns
    /// The output tensor with shape `(n, out_channels, ho, wo)`.
    pub fn forward(&mut self, params: &[f32], x: ArrayView4<f32>, mode: Mode) -> Result<Array4<f32>> {
        let (n, c, h, w) = x.dim();
        if c != self.in_channels {
            return Err(MlErr::SizeMismatch {
                a: "conv input channels",
                b: "conv weights",
                got: c,
                expected: self.in_channels,
            });
        }

        let (ho, wo) = self.output_dim(h, w);
        let weights = self.view_params(params)?;
        let mut out = Array3::zeros((n, self.out_channels, ho * wo));

        out.axis_iter_mut(Axis(0))
            .into_par_iter()
            .zip(x.axis_iter(Axis(0)))
            .for_each(|(mut o, xi)| {
                let cols = self.im2col(xi, (ho, wo));
                linalg::general_mat_mul(1.0, &weights, &cols, 0.0, &mut o);
            });

        if mode == Mode::Train {
            self.x = Some(x.to_owned());
        }

        Ok(out.into_shape_with_order((n, self.out_channels, ho, wo))?)
    }

    /// Accumulates this layer's weight gradient and computes the delta of its input.
    ///
    /// # Arguments
    /// * `params` - The model's parameters.
    /// * `grad` - The model's gradient buffer, the weight gradient is added to it.
    /// * `d` - The delta of this layer's output.
    ///
    /// # Errors
    /// `MlErr::BackwardBeforeForward` if there was no training forward pass since the last backward.
    pub fn backward(&mut self, params: &[f32], grad: &mut [f32], d: &Array4<f32>) -> Result<Array4<f32>> {
        let x = self.weight_grad(grad, d)?;

        let (n, c, h, w) = x.dim();
        let (_, oc, ho, wo) = d.dim();
        let d = d.to_shape((n, oc, ho * wo))?;
        let weights = self.view_params(params)?;
        let mut dx = Array4::zeros((n, c, h, w));

        dx.axis_iter_mut(Axis(0))
            .into_par_iter()
            .zip(d.axis_iter(Axis(0)))
            .for_each(|(mut dxi, di)| {
                let dcols = weights.t().dot(&di);
                self.col2im(dcols.view(), &mut dxi, (ho, wo));
            });

        Ok(dx)
    }

    /// Same as `backward` for the first layer of a network, where the input delta is not needed.
    pub fn backward_weights(&mut self, grad: &mut [f32], d: &Array4<f32>) -> Result<()> {
        self.weight_grad(grad, d).map(|_| ())
    }

    /// Adds `d * cols(x)^T` to the weight gradient and hands back the cached input.
    fn weight_grad(&mut self, grad: &mut [f32], d: &Array4<f32>) -> Result<Array4<f32>> {
        let x = self
            .x
            .take()
            .ok_or(MlErr::BackwardBeforeForward { layer: "conv2d" })?;

        let n = x.dim().0;
        let (_, oc, ho, wo) = d.dim();
        let d = d.to_shape((n, oc, ho * wo))?;

        let mut dw = self.view_grad(grad)?;
        for (xi, di) in x.axis_iter(Axis(0)).zip(d.axis_iter(Axis(0))) {
            let cols = self.im2col(xi, (ho, wo));
            linalg::general_mat_mul(1.0, &di, &cols.t(), 1.0, &mut dw);
        }

        Ok(x)
    }

    /// Unfolds every receptive field of `x` into a column.
    fn im2col(&self, x: ArrayView3<f32>, (ho, wo): (usize, usize)) -> Array2<f32> {
        let (c, h, w) = x.dim();
        let k = self.kernel;
        let mut cols = Array2::zeros((c * k * k, ho * wo));

        for ci in 0..c {
            for ki in 0..k {
                for kj in 0..k {
                    let mut row = cols.row_mut((ci * k + ki) * k + kj);
                    for oi in 0..ho {
                        let Some(i) = self.source_index(oi, ki, h) else {
                            continue;
                        };
                        for oj in 0..wo {
                            if let Some(j) = self.source_index(oj, kj, w) {
                                row[oi * wo + oj] = x[[ci, i, j]];
                            }
                        }
                    }
                }
            }
        }

        cols
    }

    /// Folds the columns back into `dx`, adding up overlapping receptive fields.
    fn col2im(&self, dcols: ArrayView2<f32>, dx: &mut ArrayViewMut3<f32>, (ho, wo): (usize, usize)) {
        let (c, h, w) = dx.dim();
        let k = self.kernel;

        for ci in 0..c {
            for ki in 0..k {
                for kj in 0..k {
                    let row = dcols.row((ci * k + ki) * k + kj);
                    for oi in 0..ho {
                        let Some(i) = self.source_index(oi, ki, h) else {
                            continue;
                        };
                        for oj in 0..wo {
                            if let Some(j) = self.source_index(oj, kj, w) {
                                dx[[ci, i, j]] += row[oi * wo + oj];
                            }
                        }
                    }
                }
            }
        }
    }

    /// Maps an output position and kernel offset to the input position, `None` inside the padding.
    fn source_index(&self, out: usize, k: usize, len: usize) -> Option<usize> {
        (out * self.stride + k)
            .checked_sub(self.padding)
            .filter(|&i| i < len)
    }

    fn view_params<'a>(&self, params: &'a [f32]) -> Result<ArrayView2<'a, f32>> {
        let dim = (self.out_channels, self.size() / self.out_channels);
        let raw = &params[self.offset..self.offset + self.size()];
        Ok(ArrayView2::from_shape(dim, raw)?)
    }

    fn view_grad<'a>(&self, grad: &'a mut [f32]) -> Result<ArrayViewMut2<'a, f32>> {
        let dim = (self.out_channels, self.size() / self.out_channels);
        let raw = &mut grad[self.offset..self.offset + self.size()];
        Ok(ArrayViewMut2::from_shape(dim, raw)?)
    }
}
