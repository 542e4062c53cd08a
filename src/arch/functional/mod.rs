//! Stateless tensor operations the layers are built from.

mod conv;
mod pad;

pub use conv::{conv2d, conv2d_backward, ConvGeometry, ConvGrads};
pub use pad::{pad_circular, pad_circular_backward, CircularPad};
