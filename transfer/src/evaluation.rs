use machine_learning::{
    arch::{Mode, Model, ResNet},
    metrics,
};

use crate::{Result, data::DataLoader};

/// Measures a model on held-out data at epoch boundaries.
pub trait Evaluator {
    /// Returns the model's accuracy over every batch of `loader`, in `[0, 1]`.
    ///
    /// The model is left in the mode it was in before the call.
    fn evaluate(&mut self, model: &mut ResNet, params: &[f32], loader: &mut DataLoader)
    -> Result<f32>;
}

/// Classification accuracy in inference mode: no backward caches and no running statistics
/// updates.
#[derive(Debug, Default, Clone, Copy)]
pub struct AccuracyEvaluator;

impl Evaluator for AccuracyEvaluator {
    fn evaluate(
        &mut self,
        model: &mut ResNet,
        params: &[f32],
        loader: &mut DataLoader,
    ) -> Result<f32> {
        let prev = model.mode();
        model.set_mode(Mode::Eval);

        let (mut correct, mut total) = (0, 0);
        let result = loader.iter().try_for_each(|batch| -> Result<()> {
            let logits = model.forward(params, batch.x.view())?;
            correct += metrics::correct(logits.view(), &batch.y);
            total += batch.len();
            Ok(())
        });

        model.set_mode(prev);
        result?;

        if total == 0 {
            return Ok(0.);
        }

        Ok(correct as f32 / total as f32)
    }
}
