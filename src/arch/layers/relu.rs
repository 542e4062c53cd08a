use ndarray::{Array4, ArrayView4, Zip};

use super::LayerKind;
use crate::{QatErr, Result};

/// Rectified linear unit, `max(0, x)`.
#[derive(Debug, Clone, Default)]
pub struct ReLU {
    x: Option<Array4<f32>>,
}

impl ReLU {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn forward(&mut self, x: ArrayView4<f32>) -> Array4<f32> {
        self.x = Some(x.to_owned());
        x.mapv(|v| v.max(0.0))
    }

    pub fn backward(&mut self, d: ArrayView4<f32>) -> Result<Array4<f32>> {
        let x = self.x.as_ref().ok_or(QatErr::MissingForward(LayerKind::ReLU))?;

        if x.dim() != d.dim() {
            return Err(QatErr::ShapeMismatch {
                what: "relu gradient",
                got: d.shape().to_vec(),
                expected: x.shape().to_vec(),
            });
        }

        let mut grad = d.to_owned();
        Zip::from(&mut grad).and(x).for_each(|g, &x| {
            if x <= 0.0 {
                *g = 0.0;
            }
        });

        Ok(grad)
    }
}
