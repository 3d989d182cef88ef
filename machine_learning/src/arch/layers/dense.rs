use std::{cell::RefCell, rc::Rc};

use ndarray::{Array2, ArrayView1, ArrayView2, ArrayViewMut1, ArrayViewMut2, Axis, linalg};
use rand::Rng;

use crate::{MlErr, Result, arch::Mode, initialization::RandWeightGen};

/// A fully connected layer without activation, used as the classifier head.
///
/// Its parameters are laid out as the `(inputs, outputs)` weight matrix followed by the biases.
#[derive(Debug)]
pub struct Dense {
    dim: (usize, usize),
    offset: usize,

    // Forward metadata
    x: Option<Array2<f32>>,
}

impl Dense {
    pub fn new(dim: (usize, usize), offset: usize) -> Self {
        Self { dim, offset, x: None }
    }

    /// Returns the size of this layer.
    ///
    /// # Returns
    /// The amount of parameters this layer has.
    pub fn size(&self) -> usize {
        (self.dim.0 + 1) * self.dim.1
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn inputs(&self) -> usize {
        self.dim.0
    }

    pub fn outputs(&self) -> usize {
        self.dim.1
    }

    /// Writes `U(-1/sqrt(inputs), 1/sqrt(inputs))` weights and biases into this layer's slice.
    pub fn init<R: Rng>(&self, params: &mut [f32], rng: Rc<RefCell<R>>) -> Result<()> {
        let mut weight_gen = RandWeightGen::fan_in_uniform(rng, self.size(), self.dim.0)?;
        weight_gen.fill(&mut params[self.offset..self.offset + self.size()]);
        Ok(())
    }

    pub fn forward(&mut self, params: &[f32], x: Array2<f32>, mode: Mode) -> Result<Array2<f32>> {
        if x.ncols() != self.dim.0 {
            return Err(MlErr::SizeMismatch {
                a: "dense input",
                b: "dense weights",
                got: x.ncols(),
                expected: self.dim.0,
            });
        }

        let (w, b) = self.view_params(params)?;
        let mut z = Array2::zeros((x.nrows(), self.dim.1));
        linalg::general_mat_mul(1.0, &x, &w, 0.0, &mut z);
        z += &b;

        if mode == Mode::Train {
            self.x = Some(x);
        }

        Ok(z)
    }

    pub fn backward(&mut self, params: &[f32], grad: &mut [f32], d: Array2<f32>) -> Result<Array2<f32>> {
        let x = self
            .x
            .take()
            .ok_or(MlErr::BackwardBeforeForward { layer: "dense" })?;

        {
            let (mut dw, mut db) = self.view_grad(grad)?;
            linalg::general_mat_mul(1.0, &x.t(), &d, 1.0, &mut dw);
            db += &d.sum_axis(Axis(0));
        }

        let (w, _) = self.view_params(params)?;
        Ok(d.dot(&w.t()))
    }

    /// Gives a view of the raw gradient slice as the delta weights and delta biases of this layer.
    fn view_grad<'a>(
        &self,
        grad: &'a mut [f32],
    ) -> Result<(ArrayViewMut2<'a, f32>, ArrayViewMut1<'a, f32>)> {
        let w_size = self.size() - self.dim.1;
        let raw = &mut grad[self.offset..self.offset + self.size()];
        let (dw_raw, db_raw) = raw.split_at_mut(w_size);
        let dw = ArrayViewMut2::from_shape(self.dim, dw_raw)?;
        let db = ArrayViewMut1::from_shape(self.dim.1, db_raw)?;
        Ok((dw, db))
    }

    /// Gives a view of the raw parameter slice as the weights and biases of this layer.
    fn view_params<'a>(&self, params: &'a [f32]) -> Result<(ArrayView2<'a, f32>, ArrayView1<'a, f32>)> {
        let w_size = self.size() - self.dim.1;
        let raw = &params[self.offset..self.offset + self.size()];
        let weights = ArrayView2::from_shape(self.dim, &raw[..w_size])?;
        let biases = ArrayView1::from_shape(self.dim.1, &raw[w_size..])?;
        Ok((weights, biases))
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn forward_is_affine() {
        let mut dense = Dense::new((2, 1), 0);
        let params = [2., -1., 0.5];

        let y = dense.forward(&params, array![[1., 1.], [3., 0.]], Mode::Eval).unwrap();

        assert_eq!(y, array![[1.5], [6.5]]);
    }

    #[test]
    fn backward_accumulates_grad() {
        let mut dense = Dense::new((2, 1), 0);
        let params = [2., -1., 0.5];
        let mut grad = [0.; 3];

        dense.forward(&params, array![[1., 2.]], Mode::Train).unwrap();
        let dx = dense.backward(&params, &mut grad, array![[1.]]).unwrap();

        assert_eq!(grad, [1., 2., 1.]);
        assert_eq!(dx, array![[2., -1.]]);
    }
}
