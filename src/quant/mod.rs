mod fake_quant;
mod observer;
mod prepare;
mod qconfig;
mod range;
mod rounding;

pub use fake_quant::FakeQuantize;
pub use observer::{Observer, ObserverKind};
pub use prepare::prepare_qat;
pub use qconfig::QConfig;
pub use range::{QScheme, QuantRange};
pub use rounding::{fake_quantize_grad, fake_quantize_value, QParams, RoundingMethod};
