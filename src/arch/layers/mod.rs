mod conv2d;
mod conv_relu;
mod layer;
mod options;
mod qat_conv2d;
mod relu;

pub use conv2d::{Conv2d, ParamGrads};
pub use conv_relu::ConvReLU2d;
pub use layer::{Layer, LayerKind};
pub use options::{Conv2dOptions, PaddingMode};
pub use qat_conv2d::QatConv2d;
pub use relu::ReLU;
