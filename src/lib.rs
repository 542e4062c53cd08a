//! Quantization aware training for 2D convolutions.
//!
//! Float models are built from [`arch`] layers, prepared with [`quant::prepare_qat`] and trained
//! with fake quantization simulating the rounding of a low precision deployment.

pub mod arch;
pub mod error;
pub mod optimization;
pub mod quant;
pub mod specs;

pub use error::{QatErr, Result};
