use machine_learning::arch::{Mode, ResNet};
use ndarray::Array1;

use crate::{
    Result, TransferErr,
    tap::{Capture, CaptureBuffer},
};

/// Pulls the input of every normalization layer towards a reference per-channel mean.
///
/// For layer `i` the penalty is `sum_c (ref_i[c] - mean_{n,h,w} x_i[n, c, h, w])^2`.
#[derive(Debug, Clone)]
pub struct BnRegularizer {
    references: Vec<Array1<f32>>,
}

impl BnRegularizer {
    pub fn new(references: Vec<Array1<f32>>) -> Self {
        Self { references }
    }

    /// Snapshots the running means of `model`'s normalization layers as the references.
    pub fn from_model(model: &ResNet) -> Self {
        let references = model
            .norm_layers()
            .into_iter()
            .map(|bn| bn.running_mean().to_owned())
            .collect();

        Self::new(references)
    }

    pub fn references(&self) -> &[Array1<f32>] {
        &self.references
    }

    /// One penalty per reference layer, computed from the captures of training pass `pass`.
    ///
    /// # Errors
    /// `TransferErr::StaleCapture` if a layer wasn't captured by that pass.
    pub fn compute(&self, captures: &CaptureBuffer, pass: u64) -> Result<Vec<f32>> {
        self.zip_fresh(captures, pass, |reference, capture| {
            reference
                .iter()
                .zip(&capture.channel_means)
                .map(|(r, m)| (r - m).powi(2))
                .sum::<f32>()
        })
    }

    /// The gradient of the total penalty with respect to each layer's input, constant over the
    /// batch and spatial axes: `-2 (ref[c] - m[c]) / (n * h * w)`.
    pub fn input_grads(&self, captures: &CaptureBuffer, pass: u64) -> Result<Vec<Array1<f32>>> {
        self.zip_fresh(captures, pass, |reference, capture| {
            let scale = -2. / capture.count.max(1) as f32;
            (reference - &capture.channel_means) * scale
        })
    }

    fn zip_fresh<T>(
        &self,
        captures: &CaptureBuffer,
        pass: u64,
        f: impl Fn(&Array1<f32>, &Capture) -> T,
    ) -> Result<Vec<T>> {
        self.references
            .iter()
            .enumerate()
            .map(|(layer, reference)| {
                let capture = captures
                    .get(layer)
                    .filter(|c| c.pass == pass && c.mode == Mode::Train)
                    .ok_or_else(|| TransferErr::StaleCapture {
                        layer,
                        captured: captures.get(layer).map(|c| c.pass),
                        current: pass,
                    })?;

                if capture.channel_means.len() != reference.len() {
                    return Err(TransferErr::InvalidCheckpoint(format!(
                        "norm layer {layer} has {} channels but its reference has {}",
                        capture.channel_means.len(),
                        reference.len()
                    )));
                }

                Ok(f(reference, capture))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use machine_learning::arch::{Architecture, Model, ResNetConfig};
    use ndarray::{Array, Array4};
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;
    use crate::tap::ActivationTap;

    fn tapped() -> (ResNet, Vec<f32>, ActivationTap) {
        let mut model = ResNet::new(ResNetConfig::new(Architecture::Resnet18, 3, 4).with_base_width(2));
        let params = model
            .init_params(Rc::new(RefCell::new(StdRng::seed_from_u64(2))))
            .unwrap();
        let tap = ActivationTap::install(&mut model).unwrap();
        (model, params, tap)
    }

    fn images() -> Array4<f32> {
        Array::from_shape_fn((3, 3, 8, 8), |(n, c, i, j)| ((n * 7 + c * 3 + i * j) % 11) as f32 - 4.)
    }

    #[test]
    fn penalty_is_non_negative_and_zero_on_its_own_statistics() {
        let (mut model, params, tap) = tapped();
        model.forward(&params, images().view()).unwrap();
        let pass = model.passes();

        let regularizer = BnRegularizer::new(
            (0..tap.layers())
                .map(|i| Array1::from_elem(model.norm_layers()[i].channels(), 3.))
                .collect(),
        );
        let penalties = regularizer.compute(&tap.captures(), pass).unwrap();
        assert_eq!(penalties.len(), tap.layers());
        assert!(penalties.iter().all(|&p| p >= 0.));
        assert!(penalties.iter().any(|&p| p > 0.));

        let captured = tap.captures();
        let own = BnRegularizer::new(
            (0..tap.layers())
                .map(|i| captured.get(i).unwrap().channel_means.clone())
                .collect(),
        );
        assert!(own.compute(&captured, pass).unwrap().iter().all(|&p| p == 0.));
    }

    #[test]
    fn stale_and_eval_captures_are_rejected() {
        let (mut model, params, tap) = tapped();
        let regularizer = BnRegularizer::from_model(&model);

        assert!(matches!(
            regularizer.compute(&tap.captures(), 1),
            Err(TransferErr::StaleCapture { captured: None, .. })
        ));

        model.forward(&params, images().view()).unwrap();
        assert!(matches!(
            regularizer.compute(&tap.captures(), model.passes() + 1),
            Err(TransferErr::StaleCapture { captured: Some(1), .. })
        ));

        model.set_mode(Mode::Eval);
        model.forward(&params, images().view()).unwrap();
        assert!(regularizer.compute(&tap.captures(), model.passes()).is_err());
    }

    #[test]
    fn input_grads_match_the_penalty_derivative() {
        let x = Array::from_shape_vec((2, 1, 1, 2), vec![1., 3., 5., 7.]).unwrap();
        let mut model = ResNet::new(ResNetConfig::new(Architecture::Resnet18, 1, 2).with_base_width(1));
        let tap = ActivationTap::install(&mut model).unwrap();
        let params = model
            .init_params(Rc::new(RefCell::new(StdRng::seed_from_u64(3))))
            .unwrap();
        model.forward(&params, x.view()).unwrap();

        let captured = tap.captures();
        let capture = captured.get(0).unwrap();
        let reference = &capture.channel_means + 1.;
        let regularizer = BnRegularizer::new(vec![reference]);

        let grads = regularizer.input_grads(&captured, model.passes()).unwrap();

        // (ref - m) = 1 for the single stem channel, averaged over 2 * 1 * 2 values.
        assert_eq!(grads.len(), 1);
        assert!((grads[0][0] + 0.5).abs() < 1e-6);
    }
}
