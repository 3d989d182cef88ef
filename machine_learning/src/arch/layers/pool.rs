use ndarray::{Array2, Array4, Axis};

use crate::{MlErr, Result, arch::Mode};

/// Averages every feature map down to a single value, `(n, c, h, w) -> (n, c)`.
#[derive(Debug, Default)]
pub struct GlobalAvgPool {
    dim: Option<(usize, usize, usize, usize)>,
}

impl GlobalAvgPool {
    pub fn forward(&mut self, x: Array4<f32>, mode: Mode) -> Array2<f32> {
        let (n, c, h, w) = x.dim();

        if mode == Mode::Train {
            self.dim = Some((n, c, h, w));
        }

        x.sum_axis(Axis(3)).sum_axis(Axis(2)) / (h * w).max(1) as f32
    }

    pub fn backward(&mut self, d: Array2<f32>) -> Result<Array4<f32>> {
        let (n, c, h, w) = self
            .dim
            .take()
            .ok_or(MlErr::BackwardBeforeForward { layer: "global average pool" })?;

        let d = d.into_shape_with_order((n, c, 1, 1))?;
        let mut dx = Array4::zeros((n, c, h, w));
        dx += &d;
        dx /= (h * w) as f32;

        Ok(dx)
    }
}

#[cfg(test)]
mod tests {
    use ndarray::Array;

    use super::*;

    #[test]
    fn forward_and_backward_spread_evenly() {
        let mut pool = GlobalAvgPool::default();
        let x = Array::from_shape_vec((1, 2, 2, 2), vec![1., 2., 3., 4., 0., 0., 0., 8.]).unwrap();

        let y = pool.forward(x, Mode::Train);
        assert_eq!(y, Array::from_shape_vec((1, 2), vec![2.5, 2.]).unwrap());

        let dx = pool.backward(Array::from_elem((1, 2), 4.)).unwrap();
        assert!(dx.iter().all(|&v| v == 1.));
    }
}
