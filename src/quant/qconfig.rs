use super::{FakeQuantize, Observer, ObserverKind, QParams, QScheme, QuantRange, RoundingMethod};
use crate::{
    specs::{FakeQuantSpec, QConfigSpec},
    Result,
};

/// Describes how a QAT module simulates quantization. Holds one recipe for activations and one
/// for weights; every call to a factory returns a fresh simulator.
#[derive(Debug, Clone, PartialEq)]
pub struct QConfig {
    activation: FakeQuantSpec,
    weight: FakeQuantSpec,
}

impl QConfig {
    /// Creates a new `QConfig`.
    ///
    /// # Returns
    /// An error if either recipe is invalid.
    pub fn new(activation: FakeQuantSpec, weight: FakeQuantSpec) -> Result<Self> {
        activation.validate()?;
        weight.validate()?;
        Ok(Self { activation, weight })
    }

    pub fn from_spec(spec: QConfigSpec) -> Result<Self> {
        Self::new(spec.activation, spec.weight)
    }

    /// Parses and validates a JSON encoded `QConfigSpec`.
    pub fn from_json(json: &str) -> Result<Self> {
        let spec: QConfigSpec = serde_json::from_str(json)?;
        Self::from_spec(spec)
    }

    pub fn to_spec(&self) -> QConfigSpec {
        QConfigSpec {
            activation: self.activation,
            weight: self.weight,
        }
    }

    /// Per tensor affine `quint8` activations with a moving average observer and per tensor
    /// symmetric `qint8` weights with a min-max observer.
    pub fn default_qat() -> Self {
        Self {
            activation: FakeQuantSpec::Observed {
                observer: ObserverKind::MovingAverageMinMax {
                    averaging_constant: 0.01,
                },
                qscheme: QScheme::PerTensorAffine,
                range: QuantRange::quint8(),
                rounding: RoundingMethod::HalfToEven,
            },
            weight: FakeQuantSpec::Observed {
                observer: ObserverKind::MinMax,
                qscheme: QScheme::PerTensorSymmetric,
                range: QuantRange::qint8(),
                rounding: RoundingMethod::HalfToEven,
            },
        }
    }

    /// Like [`QConfig::default_qat`] but with one weight scale per output channel.
    pub fn per_channel_qat() -> Self {
        Self {
            weight: FakeQuantSpec::Observed {
                observer: ObserverKind::MinMax,
                qscheme: QScheme::PerChannelSymmetric { ch_axis: 0 },
                range: QuantRange::qint8(),
                rounding: RoundingMethod::HalfToEven,
            },
            ..Self::default_qat()
        }
    }

    /// Builds the simulator for a module's output activation.
    pub fn activation(&self) -> FakeQuantize {
        build(&self.activation)
    }

    /// Builds the simulator for a module's weight.
    pub fn weight(&self) -> FakeQuantize {
        build(&self.weight)
    }
}

// Specs were validated when the `QConfig` was created.
fn build(spec: &FakeQuantSpec) -> FakeQuantize {
    match *spec {
        FakeQuantSpec::Observed {
            observer,
            qscheme,
            range,
            rounding,
        } => FakeQuantize::observed(Observer::new(observer, qscheme, range), rounding),
        FakeQuantSpec::Fixed {
            scale,
            zero_point,
            range,
            rounding,
        } => FakeQuantize::fixed_unchecked(QParams { scale, zero_point }, range, rounding),
        FakeQuantSpec::Identity => FakeQuantize::identity(),
    }
}
