//! Serializable descriptions of models and quantization recipes, turned into runtime values by
//! `arch::build_model` and `QConfig::from_spec`.

mod model;
mod quant;

pub use model::{Conv2dSpec, LayerSpec, ModelSpec, TrainerSpec};
pub use quant::{FakeQuantSpec, QConfigSpec};
