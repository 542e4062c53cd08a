use ndarray::{Array4, ArrayView4};

use super::{Conv2d, ConvReLU2d, QatConv2d, ReLU};
use crate::{optimization::Optimizer, quant::QConfig, Result};

/// The kind of a layer, used to tell layers apart without borrowing them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerKind {
    Conv2d,
    ConvReLU2d,
    ReLU,
    QatConv2d,
}

#[derive(Debug, Clone)]
pub enum Layer {
    Conv2d(Conv2d),
    ConvReLU2d(ConvReLU2d),
    ReLU(ReLU),
    QatConv2d(QatConv2d),
}

impl Layer {
    pub fn conv2d(conv: Conv2d) -> Self {
        Self::Conv2d(conv)
    }

    pub fn conv_relu2d(conv: Conv2d) -> Self {
        Self::ConvReLU2d(ConvReLU2d::new(conv))
    }

    pub fn relu() -> Self {
        Self::ReLU(ReLU::new())
    }

    pub fn qat_conv2d(conv: QatConv2d) -> Self {
        Self::QatConv2d(conv)
    }

    pub fn kind(&self) -> LayerKind {
        match self {
            Self::Conv2d(_) => LayerKind::Conv2d,
            Self::ConvReLU2d(_) => LayerKind::ConvReLU2d,
            Self::ReLU(_) => LayerKind::ReLU,
            Self::QatConv2d(_) => LayerKind::QatConv2d,
        }
    }

    /// The qconfig attached to or owned by this layer, if any. A fused unit without one of its
    /// own reports its convolution's.
    pub fn qconfig(&self) -> Option<&QConfig> {
        match self {
            Self::Conv2d(l) => l.qconfig(),
            Self::ConvReLU2d(l) => l.qconfig().or(l.first().qconfig()),
            Self::ReLU(_) => None,
            Self::QatConv2d(l) => Some(l.qconfig()),
        }
    }

    pub fn forward(&mut self, x: ArrayView4<f32>) -> Result<Array4<f32>> {
        match self {
            Self::Conv2d(l) => l.forward(x),
            Self::ConvReLU2d(l) => l.forward(x),
            Self::ReLU(l) => Ok(l.forward(x)),
            Self::QatConv2d(l) => l.forward(x),
        }
    }

    pub fn backward(&mut self, d: ArrayView4<f32>) -> Result<Array4<f32>> {
        match self {
            Self::Conv2d(l) => l.backward(d),
            Self::ConvReLU2d(l) => l.backward(d),
            Self::ReLU(l) => l.backward(d),
            Self::QatConv2d(l) => l.backward(d),
        }
    }

    pub fn step<O: Optimizer>(&mut self, optimizer: &mut O) {
        match self {
            Self::Conv2d(l) => l.step(optimizer),
            Self::ConvReLU2d(l) => l.step(optimizer),
            Self::ReLU(_) => {}
            Self::QatConv2d(l) => l.step(optimizer),
        }
    }

    /// Turns statistics gathering on or off. Only QAT layers are affected.
    pub fn enable_observer(&mut self, enabled: bool) {
        if let Self::QatConv2d(l) = self {
            l.enable_observer(enabled);
        }
    }

    /// Turns fake quantization on or off. Only QAT layers are affected.
    pub fn enable_fake_quant(&mut self, enabled: bool) {
        if let Self::QatConv2d(l) = self {
            l.enable_fake_quant(enabled);
        }
    }
}
