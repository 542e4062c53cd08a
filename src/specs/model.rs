use std::num::NonZeroUsize;

use serde::{Deserialize, Serialize};

use super::QConfigSpec;
use crate::arch::layers::Conv2dOptions;

/// The specification for a float convolution, optionally marked for quantization aware training.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conv2dSpec {
    #[serde(flatten)]
    pub options: Conv2dOptions,
    #[serde(default)]
    pub qconfig: Option<QConfigSpec>,
}

/// The specification for the `Layer` enum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerSpec {
    Conv2d(Conv2dSpec),
    ConvRelu2d(Conv2dSpec),
    Relu,
}

/// The specification for a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelSpec {
    Sequential { layers: Vec<LayerSpec> },
}

/// The specification for a quantization aware training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerSpec {
    pub model: ModelSpec,
    /// Applied to every convolution without a qconfig of its own.
    #[serde(default)]
    pub qconfig: Option<QConfigSpec>,
    pub learning_rate: f32,
    pub steps: NonZeroUsize,
    pub batch_size: NonZeroUsize,
    /// Spatial size of the synthetic samples, `(height, width)`.
    pub input_size: (usize, usize),
    pub seed: Option<u64>,
}
