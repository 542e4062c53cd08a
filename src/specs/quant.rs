use serde::{Deserialize, Serialize};

use crate::{
    quant::{ObserverKind, QScheme, QuantRange, RoundingMethod},
    QatErr, Result,
};

/// The specification for a `FakeQuantize` simulator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FakeQuantSpec {
    Observed {
        observer: ObserverKind,
        qscheme: QScheme,
        range: QuantRange,
        #[serde(default)]
        rounding: RoundingMethod,
    },
    Fixed {
        scale: f32,
        zero_point: i32,
        range: QuantRange,
        #[serde(default)]
        rounding: RoundingMethod,
    },
    Identity,
}

impl FakeQuantSpec {
    /// Checks the invariants serde can't enforce on its own.
    pub fn validate(&self) -> Result<()> {
        match *self {
            FakeQuantSpec::Observed {
                observer, range, ..
            } => {
                QuantRange::new(range.quant_min, range.quant_max)?;
                observer.validate()
            }
            FakeQuantSpec::Fixed {
                scale,
                zero_point,
                range,
                ..
            } => {
                QuantRange::new(range.quant_min, range.quant_max)?;
                if !(scale.is_finite() && scale > 0.0) {
                    return Err(QatErr::InvalidConfig(format!(
                        "fixed scale must be positive, got {scale}"
                    )));
                }
                if zero_point < range.quant_min || zero_point > range.quant_max {
                    return Err(QatErr::InvalidConfig(format!(
                        "zero_point {zero_point} is outside [{}, {}]",
                        range.quant_min, range.quant_max
                    )));
                }
                Ok(())
            }
            FakeQuantSpec::Identity => Ok(()),
        }
    }
}

/// The specification for a `QConfig`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QConfigSpec {
    pub activation: FakeQuantSpec,
    pub weight: FakeQuantSpec,
}
