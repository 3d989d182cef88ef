use ndarray::{Array2, ArrayView2, Axis};

use super::LossFn;
use crate::{MlErr, Result};

/// Softmax cross entropy averaged over the batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct CrossEntropy;

impl CrossEntropy {
    /// Row-wise softmax, shifted by the row maximum for stability.
    fn softmax(logits: ArrayView2<f32>) -> Array2<f32> {
        let mut probs = logits.to_owned();

        for mut row in probs.axis_iter_mut(Axis(0)) {
            let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
            row.mapv_inplace(|v| (v - max).exp());
            let sum = row.sum();
            row /= sum;
        }

        probs
    }

    fn check(logits: ArrayView2<f32>, labels: &[usize]) -> Result<()> {
        if logits.nrows() != labels.len() {
            return Err(MlErr::SizeMismatch {
                a: "logits",
                b: "labels",
                got: logits.nrows(),
                expected: labels.len(),
            });
        }

        let classes = logits.ncols();
        match labels.iter().find(|&&label| label >= classes) {
            Some(&label) => Err(MlErr::LabelOutOfRange { label, classes }),
            None => Ok(()),
        }
    }
}

impl LossFn for CrossEntropy {
    fn loss(&self, logits: ArrayView2<f32>, labels: &[usize]) -> Result<f32> {
        Self::check(logits, labels)?;

        let probs = Self::softmax(logits);
        let total: f32 = labels
            .iter()
            .enumerate()
            .map(|(i, &label)| -probs[[i, label]].max(f32::MIN_POSITIVE).ln())
            .sum();

        Ok(total / labels.len().max(1) as f32)
    }

    fn loss_prime(&self, logits: ArrayView2<f32>, labels: &[usize]) -> Result<Array2<f32>> {
        Self::check(logits, labels)?;

        let mut d = Self::softmax(logits);
        for (i, &label) in labels.iter().enumerate() {
            d[[i, label]] -= 1.;
        }

        d /= labels.len().max(1) as f32;
        Ok(d)
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn uniform_logits_cost_ln_classes() {
        let logits = Array2::zeros((2, 4));
        let loss = CrossEntropy.loss(logits.view(), &[0, 3]).unwrap();
        assert!((loss - 4f32.ln()).abs() < 1e-6);
    }

    #[test]
    fn confident_right_answer_is_cheap() {
        let logits = array![[20., 0., 0.]];
        assert!(CrossEntropy.loss(logits.view(), &[0]).unwrap() < 1e-6);
    }

    #[test]
    fn gradient_rows_sum_to_zero_and_push_towards_label() {
        let logits = array![[1., 2., 3.], [0., 0., 5.]];
        let d = CrossEntropy.loss_prime(logits.view(), &[0, 2]).unwrap();

        for row in d.axis_iter(Axis(0)) {
            assert!(row.sum().abs() < 1e-6);
        }
        assert!(d[[0, 0]] < 0.);
        assert!(d[[0, 2]] > 0.);
    }

    #[test]
    fn label_out_of_range() {
        let logits = Array2::zeros((1, 2));
        assert!(matches!(
            CrossEntropy.loss(logits.view(), &[2]),
            Err(MlErr::LabelOutOfRange { label: 2, classes: 2 })
        ));
    }
}
