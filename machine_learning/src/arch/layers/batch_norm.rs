use ndarray::{Array1, Array4, ArrayView1, ArrayView4, ArrayViewMut1, Axis};

use crate::{
    MlErr, Result,
    arch::{Mode, hooks::HookRegistry},
};

const MOMENTUM: f32 = 0.1;
const EPSILON: f32 = 1e-5;

/// Batch normalization over the channel axis of `NCHW` tensors.
///
/// The learnable scale and shift live in the flat parameter buffer as `[gamma.., beta..]`, while
/// the running statistics are buffers owned by the layer.
#[derive(Debug)]
pub struct BatchNorm2d {
    channels: usize,
    offset: usize,
    index: usize,
    running_mean: Array1<f32>,
    running_var: Array1<f32>,

    // Forward metadata
    cache: Option<Cache>,
}

#[derive(Debug)]
struct Cache {
    x_hat: Array4<f32>,
    inv_std: Array1<f32>,
}

impl BatchNorm2d {
    /// Creates a new `BatchNorm2d` layer with zero running mean and unit running variance.
    ///
    /// # Arguments
    /// * `channels` - The amount of normalized channels.
    /// * `offset` - The position of this layer's parameters in the flat parameter buffer.
    /// * `index` - The position of this layer among the model's normalization layers.
    pub fn new(channels: usize, offset: usize, index: usize) -> Self {
        Self {
            channels,
            offset,
            index,
            running_mean: Array1::zeros(channels),
            running_var: Array1::ones(channels),
            cache: None,
        }
    }

    pub fn size(&self) -> usize {
        2 * self.channels
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// The position of this layer in the model's traversal order of normalization layers.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn running_mean(&self) -> ArrayView1<'_, f32> {
        self.running_mean.view()
    }

    pub fn running_var(&self) -> ArrayView1<'_, f32> {
        self.running_var.view()
    }

    /// Overwrites the running statistics, used when restoring a saved model.
    ///
    /// # Errors
    /// `MlErr::SizeMismatch` if either statistic doesn't have one value per channel.
    pub fn set_running_stats(&mut self, mean: Array1<f32>, var: Array1<f32>) -> Result<()> {
        for (what, got) in [("running mean", mean.len()), ("running var", var.len())] {
            if got != self.channels {
                return Err(MlErr::SizeMismatch {
                    a: what,
                    b: "batch norm channels",
                    got,
                    expected: self.channels,
                });
            }
        }

        self.running_mean = mean;
        self.running_var = var;
        Ok(())
    }

    /// Writes `gamma = 1` and `beta = 0` into this layer's slice of `params`.
    pub fn init(&self, params: &mut [f32]) {
        let (gamma, beta) = params[self.offset..self.offset + self.size()].split_at_mut(self.channels);
        gamma.fill(1.);
        beta.fill(0.);
    }

    /// Normalizes `x` and notifies the registered forward hooks with this layer's input and output.
    ///
    /// In `Mode::Train` the batch statistics are used and folded into the running statistics,
    /// in `Mode::Eval` the running statistics are used and nothing is cached.
    pub fn forward(
        &mut self,
        params: &[f32],
        x: Array4<f32>,
        mode: Mode,
        hooks: &mut HookRegistry,
    ) -> Result<Array4<f32>> {
        let (n, c, h, w) = x.dim();
        if c != self.channels {
            return Err(MlErr::SizeMismatch {
                a: "batch norm input channels",
                b: "batch norm layer",
                got: c,
                expected: self.channels,
            });
        }

        let (mean, var) = match mode {
            Mode::Train => {
                let (mean, var) = channel_stats(x.view());
                let m = (n * h * w) as f32;
                let unbiased = if m > 1. { m / (m - 1.) } else { 1. };

                self.running_mean *= 1. - MOMENTUM;
                self.running_mean.scaled_add(MOMENTUM, &mean);
                self.running_var *= 1. - MOMENTUM;
                self.running_var.scaled_add(MOMENTUM * unbiased, &var);
                (mean, var)
            }
            Mode::Eval => (self.running_mean.clone(), self.running_var.clone()),
        };

        let inv_std = var.mapv(|v| 1. / (v + EPSILON).sqrt());
        let x_hat = (&x - &per_channel(mean.view())?) * &per_channel(inv_std.view())?;

        let (gamma, beta) = self.view_params(params)?;
        let y = &x_hat * &per_channel(gamma)? + &per_channel(beta)?;

        if mode == Mode::Train {
            self.cache = Some(Cache { x_hat, inv_std });
        }

        hooks.notify(self.index, x.view(), y.view());
        Ok(y)
    }

    /// Accumulates the gradients of gamma and beta and returns the delta of the input.
    ///
    /// # Arguments
    /// * `params` - The model's parameters.
    /// * `grad` - The model's gradient buffer.
    /// * `d` - The delta of this layer's output.
    /// * `input_grad` - An extra per-channel gradient added to every element of the input delta.
    pub fn backward(
        &mut self,
        params: &[f32],
        grad: &mut [f32],
        d: Array4<f32>,
        input_grad: Option<&Array1<f32>>,
    ) -> Result<Array4<f32>> {
        let Cache { x_hat, inv_std } = self
            .cache
            .take()
            .ok_or(MlErr::BackwardBeforeForward { layer: "batch norm" })?;

        let (n, _, h, w) = d.dim();
        let m = (n * h * w) as f32;

        let dbeta = sum_channels(d.view());
        let dgamma = sum_channels((&d * &x_hat).view());

        {
            let (mut dg, mut db) = self.view_grad(grad)?;
            dg += &dgamma;
            db += &dbeta;
        }

        let (gamma, _) = self.view_params(params)?;
        let scale = &gamma * &inv_std / m;

        let mut dx = d * m;
        dx -= &per_channel(dbeta.view())?;
        dx -= &(&x_hat * &per_channel(dgamma.view())?);
        dx *= &per_channel(scale.view())?;

        if let Some(g) = input_grad {
            dx += &per_channel(g.view())?;
        }

        Ok(dx)
    }

    fn view_params<'a>(&self, params: &'a [f32]) -> Result<(ArrayView1<'a, f32>, ArrayView1<'a, f32>)> {
        let (gamma, beta) = params[self.offset..self.offset + self.size()].split_at(self.channels);
        Ok((
            ArrayView1::from_shape(self.channels, gamma)?,
            ArrayView1::from_shape(self.channels, beta)?,
        ))
    }

    fn view_grad<'a>(
        &self,
        grad: &'a mut [f32],
    ) -> Result<(ArrayViewMut1<'a, f32>, ArrayViewMut1<'a, f32>)> {
        let (dgamma, dbeta) =
            grad[self.offset..self.offset + self.size()].split_at_mut(self.channels);
        Ok((
            ArrayViewMut1::from_shape(self.channels, dgamma)?,
            ArrayViewMut1::from_shape(self.channels, dbeta)?,
        ))
    }
}

/// Returns the per-channel mean and biased variance of `x` over the batch and spatial axes.
pub fn channel_stats(x: ArrayView4<f32>) -> (Array1<f32>, Array1<f32>) {
    let (n, _, h, w) = x.dim();
    let m = (n * h * w).max(1) as f32;

    let mean = sum_channels(x) / m;
    let var = x
        .axis_iter(Axis(1))
        .zip(&mean)
        .map(|(xc, &mu)| xc.fold(0., |acc, &v| acc + (v - mu).powi(2)) / m)
        .collect();

    (mean, var)
}

fn sum_channels(x: ArrayView4<f32>) -> Array1<f32> {
    x.sum_axis(Axis(3)).sum_axis(Axis(2)).sum_axis(Axis(0))
}

/// Views a per-channel vector as `(1, c, 1, 1)` so it broadcasts over an `NCHW` tensor.
fn per_channel(v: ArrayView1<f32>) -> Result<ArrayView4<'_, f32>> {
    let c = v.len();
    Ok(v.into_shape_with_order((1, c, 1, 1))?)
}

#[cfg(test)]
mod tests {
    use ndarray::Array;

    use super::*;

    fn input() -> Array4<f32> {
        Array::from_shape_fn((4, 2, 3, 3), |(n, c, i, j)| {
            (c as f32 * 3.) + ((n * 5 + i * 3 + j) % 7) as f32 * 0.5
        })
    }

    fn params(bn: &BatchNorm2d) -> Vec<f32> {
        let mut params = vec![0.; bn.size()];
        bn.init(&mut params);
        params
    }

    #[test]
    fn train_forward_normalizes_channels() {
        let mut bn = BatchNorm2d::new(2, 0, 0);
        let params = params(&bn);
        let mut hooks = HookRegistry::default();

        let y = bn.forward(&params, input(), Mode::Train, &mut hooks).unwrap();
        let (mean, var) = channel_stats(y.view());

        assert!(mean.iter().all(|m| m.abs() < 1e-4));
        assert!(var.iter().all(|v| (v - 1.).abs() < 1e-3));
    }

    #[test]
    fn train_forward_updates_running_stats() {
        let mut bn = BatchNorm2d::new(2, 0, 0);
        let params = params(&bn);
        let mut hooks = HookRegistry::default();
        let (mean, _) = channel_stats(input().view());

        bn.forward(&params, input(), Mode::Train, &mut hooks).unwrap();

        for (rm, m) in bn.running_mean().iter().zip(&mean) {
            assert!((rm - 0.1 * m).abs() < 1e-5);
        }
    }

    #[test]
    fn eval_forward_uses_running_stats() {
        let mut bn = BatchNorm2d::new(2, 0, 0);
        let params = params(&bn);
        let mut hooks = HookRegistry::default();
        bn.set_running_stats(Array1::from(vec![1., 2.]), Array1::from(vec![4., 4.]))
            .unwrap();

        let x = Array4::from_elem((1, 2, 1, 1), 3.);
        let y = bn.forward(&params, x, Mode::Eval, &mut hooks).unwrap();

        assert!((y[[0, 0, 0, 0]] - 1.).abs() < 1e-3);
        assert!((y[[0, 1, 0, 0]] - 0.5).abs() < 1e-3);
        assert_eq!(bn.running_mean().to_vec(), vec![1., 2.]);
        assert!(bn.backward(&params, &mut [0.; 4], y, None).is_err());
    }

    #[test]
    fn rejects_running_stats_of_wrong_len() {
        let mut bn = BatchNorm2d::new(2, 0, 0);
        assert!(bn.set_running_stats(Array1::zeros(3), Array1::ones(2)).is_err());
    }

    #[test]
    fn gradients_match_finite_differences() {
        let mut bn = BatchNorm2d::new(2, 0, 0);
        let params = vec![1.5, 0.5, 0.2, -0.3];
        let mut hooks = HookRegistry::default();
        let x = input();
        let r = Array::from_shape_fn(x.dim(), |(n, c, i, j)| ((n + 2 * c + i + 3 * j) % 5) as f32 - 2.);
        let extra = Array1::from(vec![0.25, -0.5]);

        bn.forward(&params, x.clone(), Mode::Train, &mut hooks).unwrap();
        let mut grad = vec![0.; 4];
        let dx = bn.backward(&params, &mut grad, r.clone(), Some(&extra)).unwrap();

        // loss = sum(y * r) + sum_c extra[c] * sum(x[:, c])
        let mut loss = |params: &[f32], x: &Array4<f32>| {
            let y = bn.forward(params, x.clone(), Mode::Train, &mut hooks).unwrap();
            let linear: f32 = x
                .axis_iter(Axis(1))
                .zip(&extra)
                .map(|(xc, e)| xc.sum() * e)
                .sum();
            (&y * &r).sum() + linear
        };

        let eps = 1e-2;
        for i in 0..4 {
            let mut plus = params.clone();
            let mut minus = params.clone();
            plus[i] += eps;
            minus[i] -= eps;
            let numeric = (loss(&plus, &x) - loss(&minus, &x)) / (2. * eps);
            assert!((numeric - grad[i]).abs() < 2e-2, "param {i}: {numeric} vs {}", grad[i]);
        }

        for idx in [[0, 0, 0, 0], [1, 1, 2, 1], [3, 0, 1, 2]] {
            let mut plus = x.clone();
            let mut minus = x.clone();
            plus[idx] += eps;
            minus[idx] -= eps;
            let numeric = (loss(&params, &plus) - loss(&params, &minus)) / (2. * eps);
            assert!((numeric - dx[idx]).abs() < 2e-2, "input {idx:?}: {numeric} vs {}", dx[idx]);
        }
    }
}
