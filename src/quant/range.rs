use serde::{Deserialize, Serialize};

use crate::{QatErr, Result};

/// The inclusive integer range a simulator quantizes onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantRange {
    pub quant_min: i32,
    pub quant_max: i32,
}

impl QuantRange {
    /// Smallest `quant_min` accepted, the bottom of the signed 16 bit range.
    pub const MIN: i32 = -(1 << 15);

    /// Largest `quant_max` accepted, the top of the unsigned 16 bit range.
    pub const MAX: i32 = (1 << 16) - 1;

    /// Creates a new `QuantRange`.
    ///
    /// # Returns
    /// An error if the range holds less than two levels or reaches outside
    /// `[QuantRange::MIN, QuantRange::MAX]`.
    pub fn new(quant_min: i32, quant_max: i32) -> Result<Self> {
        if quant_min >= quant_max {
            return Err(QatErr::InvalidConfig(format!(
                "quant_min ({quant_min}) must be smaller than quant_max ({quant_max})"
            )));
        }
        if quant_min < Self::MIN || quant_max > Self::MAX {
            return Err(QatErr::InvalidConfig(format!(
                "range [{quant_min}, {quant_max}] exceeds [{}, {}]",
                Self::MIN,
                Self::MAX
            )));
        }

        Ok(Self {
            quant_min,
            quant_max,
        })
    }

    /// Unsigned 8 bit range, `[0, 255]`.
    pub fn quint8() -> Self {
        Self::unsigned(8)
    }

    /// Signed 8 bit range, `[-128, 127]`.
    pub fn qint8() -> Self {
        Self::signed(8)
    }

    /// Two's complement range for `bits` bits, `bits` in `2..=16`.
    pub fn signed(bits: u32) -> Self {
        let bits = bits.clamp(2, 16);
        let quant_max = (1 << (bits - 1)) - 1;
        Self {
            quant_min: -quant_max - 1,
            quant_max,
        }
    }

    /// Unsigned range for `bits` bits, `bits` in `1..=16`.
    pub fn unsigned(bits: u32) -> Self {
        let bits = bits.clamp(1, 16);
        Self {
            quant_min: 0,
            quant_max: (1 << bits) - 1,
        }
    }

    /// Halves the range, keeping its sign convention. Leaves headroom for accumulators that would
    /// otherwise overflow on some int8 kernels.
    pub fn reduced(self) -> Self {
        if self.quant_min < 0 {
            Self {
                quant_min: self.quant_min / 2,
                quant_max: self.quant_max / 2,
            }
        } else {
            Self {
                quant_min: self.quant_min,
                quant_max: (i64::from(self.quant_min) + self.width() / 2) as i32,
            }
        }
    }

    pub fn is_signed(&self) -> bool {
        self.quant_min < 0
    }

    /// Returns the amount of representable levels.
    pub fn levels(&self) -> usize {
        (self.width() + 1) as usize
    }

    fn width(&self) -> i64 {
        i64::from(self.quant_max) - i64::from(self.quant_min)
    }
}

/// How quantization parameters are shared across a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QScheme {
    PerTensorAffine,
    PerTensorSymmetric,
    PerChannelAffine { ch_axis: usize },
    PerChannelSymmetric { ch_axis: usize },
}

impl QScheme {
    pub fn is_symmetric(&self) -> bool {
        matches!(
            self,
            QScheme::PerTensorSymmetric | QScheme::PerChannelSymmetric { .. }
        )
    }

    /// Returns the channel axis for per channel schemes.
    pub fn ch_axis(&self) -> Option<usize> {
        match *self {
            QScheme::PerChannelAffine { ch_axis } | QScheme::PerChannelSymmetric { ch_axis } => {
                Some(ch_axis)
            }
            _ => None,
        }
    }
}
