use std::{
    error::Error,
    fmt::{self, Display},
};

use ndarray::ShapeError;

use crate::arch::layers::LayerKind;

/// The result type used in the entire crate.
pub type Result<T> = std::result::Result<T, QatErr>;

/// The crate's error type.
#[derive(Debug)]
pub enum QatErr {
    /// A QAT module was built without a qconfig, either directly or through `from_float` on a
    /// layer that carries none.
    MissingQConfig,
    /// `from_float` was handed a layer of a kind it can't convert.
    TypeMismatch {
        expected: LayerKind,
        got: LayerKind,
    },
    InvalidGeometry(String),
    InvalidPadding {
        pad: usize,
        size: usize,
    },
    ShapeMismatch {
        what: &'static str,
        got: Vec<usize>,
        expected: Vec<usize>,
    },
    InvalidConfig(String),
    /// `backward` was called on a layer that has no cached forward pass.
    MissingForward(LayerKind),
    Shape(ShapeError),
    Json(serde_json::Error),
}

impl Display for QatErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QatErr::MissingQConfig => write!(f, "qconfig must be provided for QAT module"),
            QatErr::TypeMismatch { expected, got } => write!(
                f,
                "QatConv2d::from_float only works for {expected:?} (or a fused {:?}), got {got:?}",
                LayerKind::ConvReLU2d
            ),
            QatErr::InvalidGeometry(msg) => write!(f, "invalid convolution geometry: {msg}"),
            QatErr::InvalidPadding { pad, size } => write!(
                f,
                "circular padding of {pad} exceeds the input dimension of size {size}"
            ),
            QatErr::ShapeMismatch {
                what,
                got,
                expected,
            } => write!(
                f,
                "There's a shape mismatch in {what}, got {got:?} and expected {expected:?}"
            ),
            QatErr::InvalidConfig(msg) => write!(f, "invalid config: {msg}"),
            QatErr::MissingForward(kind) => {
                write!(f, "{kind:?} backward called before any forward pass")
            }
            QatErr::Shape(e) => write!(f, "shape error: {e}"),
            QatErr::Json(e) => write!(f, "json error: {e}"),
        }
    }
}

impl Error for QatErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            QatErr::Shape(e) => Some(e),
            QatErr::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ShapeError> for QatErr {
    fn from(value: ShapeError) -> Self {
        Self::Shape(value)
    }
}

impl From<serde_json::Error> for QatErr {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}
