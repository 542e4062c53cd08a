use ndarray::{Array4, ArrayView4};

use super::{Conv2d, ReLU};
use crate::{optimization::Optimizer, quant::QConfig, Result};

/// A convolution fused with the ReLU that follows it, treated as a single unit.
#[derive(Debug, Clone)]
pub struct ConvReLU2d {
    conv: Conv2d,
    relu: ReLU,
    qconfig: Option<QConfig>,
}

impl ConvReLU2d {
    pub fn new(conv: Conv2d) -> Self {
        Self {
            conv,
            relu: ReLU::new(),
            qconfig: None,
        }
    }

    /// Attaches a qconfig to the fused unit as a whole.
    pub fn with_qconfig(mut self, qconfig: QConfig) -> Self {
        self.qconfig = Some(qconfig);
        self
    }

    pub fn set_qconfig(&mut self, qconfig: Option<QConfig>) {
        self.qconfig = qconfig;
    }

    pub fn qconfig(&self) -> Option<&QConfig> {
        self.qconfig.as_ref()
    }

    /// The convolution part.
    pub fn first(&self) -> &Conv2d {
        &self.conv
    }

    pub fn first_mut(&mut self) -> &mut Conv2d {
        &mut self.conv
    }

    pub fn forward(&mut self, x: ArrayView4<f32>) -> Result<Array4<f32>> {
        let z = self.conv.forward(x)?;
        Ok(self.relu.forward(z.view()))
    }

    pub fn backward(&mut self, d: ArrayView4<f32>) -> Result<Array4<f32>> {
        let d = self.relu.backward(d)?;
        self.conv.backward(d.view())
    }

    pub fn step<O: Optimizer>(&mut self, optimizer: &mut O) {
        self.conv.step(optimizer);
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{Array, Array1};

    use super::*;
    use crate::arch::{layers::Conv2dOptions, Param};

    #[test]
    fn forward_applies_relu_after_conv() {
        let conv = Conv2d::with_params(
            Conv2dOptions::new(1, 1, (1, 1)),
            Param::new(Array4::from_elem((1, 1, 1, 1), -1.0)),
            Some(Param::new(Array1::from(vec![0.5]))),
        )
        .unwrap();
        let mut fused = ConvReLU2d::new(conv);
        let x = Array::from_shape_vec((1, 1, 1, 2), vec![0.25, 2.0]).unwrap();

        let out = fused.forward(x.view()).unwrap();
        let dx = fused.backward(Array4::ones((1, 1, 1, 2)).view()).unwrap();

        assert_eq!(out.into_raw_vec_and_offset().0, vec![0.25, 0.0]);
        assert_eq!(dx.into_raw_vec_and_offset().0, vec![-1.0, 0.0]);
    }
}
