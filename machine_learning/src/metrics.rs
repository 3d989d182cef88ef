use ndarray::{ArrayView2, Axis};

/// The index of the largest logit of every row, ties go to the first one.
pub fn argmax(logits: ArrayView2<f32>) -> Vec<usize> {
    logits
        .axis_iter(Axis(0))
        .map(|row| {
            row.iter()
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |best, (i, &v)| if v > best.1 { (i, v) } else { best })
                .0
        })
        .collect()
}

/// The amount of rows whose largest logit is the label.
pub fn correct(logits: ArrayView2<f32>, labels: &[usize]) -> usize {
    argmax(logits)
        .into_iter()
        .zip(labels)
        .filter(|(pred, label)| pred == *label)
        .count()
}

/// The fraction of rows whose largest logit is the label, zero for an empty batch.
pub fn accuracy(logits: ArrayView2<f32>, labels: &[usize]) -> f32 {
    if labels.is_empty() {
        return 0.;
    }

    correct(logits, labels) as f32 / labels.len() as f32
}
