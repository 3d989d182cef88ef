use ndarray::Array4;

use crate::{MlErr, Result, arch::Mode};

/// Rectified linear unit, remembers its output to mask the backward delta.
#[derive(Debug, Default)]
pub struct ReLU {
    y: Option<Array4<f32>>,
}

impl ReLU {
    pub fn forward(&mut self, mut x: Array4<f32>, mode: Mode) -> Array4<f32> {
        x.mapv_inplace(|v| v.max(0.));

        if mode == Mode::Train {
            self.y = Some(x.clone());
        }

        x
    }

    pub fn backward(&mut self, mut d: Array4<f32>) -> Result<Array4<f32>> {
        let y = self
            .y
            .take()
            .ok_or(MlErr::BackwardBeforeForward { layer: "relu" })?;

        d.zip_mut_with(&y, |d, &y| {
            if y <= 0. {
                *d = 0.
            }
        });

        Ok(d)
    }
}
