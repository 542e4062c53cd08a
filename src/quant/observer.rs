use ndarray::{ArrayViewD, Axis};
use serde::{Deserialize, Serialize};

use super::{QParams, QScheme, QuantRange};
use crate::{QatErr, Result};

/// How an observer folds new statistics into its running range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObserverKind {
    /// Tracks the all-time minimum and maximum.
    MinMax,
    /// Exponential moving average of each batch's minimum and maximum. The first batch seeds the
    /// running values.
    MovingAverageMinMax { averaging_constant: f32 },
}

impl ObserverKind {
    pub fn validate(&self) -> Result<()> {
        if let ObserverKind::MovingAverageMinMax { averaging_constant } = *self {
            if !(averaging_constant > 0.0 && averaging_constant <= 1.0) {
                return Err(QatErr::InvalidConfig(format!(
                    "averaging_constant must be in (0, 1], got {averaging_constant}"
                )));
            }
        }

        Ok(())
    }
}

/// Records the range of the values flowing through a simulator and derives quantization
/// parameters from it.
#[derive(Debug, Clone)]
pub struct Observer {
    kind: ObserverKind,
    qscheme: QScheme,
    range: QuantRange,
    // One entry per channel, or a single entry for per tensor schemes. Empty until the first
    // observation.
    min_val: Vec<f32>,
    max_val: Vec<f32>,
}

impl Observer {
    /// Creates a new `Observer` that hasn't seen any data yet.
    pub fn new(kind: ObserverKind, qscheme: QScheme, range: QuantRange) -> Self {
        Self {
            kind,
            qscheme,
            range,
            min_val: Vec::new(),
            max_val: Vec::new(),
        }
    }

    pub fn qscheme(&self) -> QScheme {
        self.qscheme
    }

    pub fn range(&self) -> QuantRange {
        self.range
    }

    pub fn is_initialized(&self) -> bool {
        !self.min_val.is_empty()
    }

    /// Returns the running `(min, max)` per slice.
    pub fn min_max(&self) -> impl Iterator<Item = (f32, f32)> + '_ {
        self.min_val.iter().copied().zip(self.max_val.iter().copied())
    }

    /// Updates the running statistics with `x`.
    ///
    /// # Arguments
    /// * `x` - The tensor to observe.
    ///
    /// # Returns
    /// An error if the scheme's channel axis doesn't exist in `x`.
    pub fn observe(&mut self, x: ArrayViewD<f32>) -> Result<()> {
        if x.is_empty() {
            return Ok(());
        }

        let (mins, maxs) = match self.qscheme.ch_axis() {
            None => {
                let (min, max) = slice_min_max(x.iter().copied());
                (vec![min], vec![max])
            }
            Some(ch_axis) => {
                if ch_axis >= x.ndim() {
                    return Err(QatErr::ShapeMismatch {
                        what: "observer channel axis",
                        got: x.shape().to_vec(),
                        expected: vec![ch_axis + 1],
                    });
                }

                x.axis_iter(Axis(ch_axis))
                    .map(|channel| slice_min_max(channel.iter().copied()))
                    .unzip()
            }
        };

        // A change in the amount of channels invalidates the old statistics.
        if self.min_val.len() != mins.len() {
            self.min_val = mins;
            self.max_val = maxs;
            return Ok(());
        }

        match self.kind {
            ObserverKind::MinMax => {
                for (cur, new) in self.min_val.iter_mut().zip(mins) {
                    *cur = cur.min(new);
                }
                for (cur, new) in self.max_val.iter_mut().zip(maxs) {
                    *cur = cur.max(new);
                }
            }
            ObserverKind::MovingAverageMinMax { averaging_constant: c } => {
                for (cur, new) in self.min_val.iter_mut().zip(mins) {
                    *cur += c * (new - *cur);
                }
                for (cur, new) in self.max_val.iter_mut().zip(maxs) {
                    *cur += c * (new - *cur);
                }
            }
        }

        Ok(())
    }

    /// Computes the quantization parameters for the observed range, one per slice.
    ///
    /// # Returns
    /// A single `scale = 1, zero_point = 0` entry if nothing was observed yet.
    pub fn calculate_qparams(&self) -> Vec<QParams> {
        if !self.is_initialized() {
            return vec![QParams::default()];
        }

        self.min_max()
            .map(|(min, max)| self.qparams_for(min, max))
            .collect()
    }

    fn qparams_for(&self, min: f32, max: f32) -> QParams {
        let QuantRange {
            quant_min,
            quant_max,
        } = self.range;

        // The range always includes zero so that it's exactly representable.
        let min = min.min(0.0);
        let max = max.max(0.0);

        let width = (i64::from(quant_max) - i64::from(quant_min)) as f32;

        if self.qscheme.is_symmetric() {
            let max_abs = (-min).max(max);
            let scale = (max_abs / (width / 2.0)).max(f32::EPSILON);
            let zero_point = if self.range.is_signed() {
                0
            } else {
                ((i64::from(quant_min) + i64::from(quant_max) + 1) / 2) as i32
            };

            return QParams { scale, zero_point };
        }

        let scale = ((max - min) / width).max(f32::EPSILON);
        let zero_point = (quant_min as f32 - (min / scale).round()) as i32;

        QParams {
            scale,
            zero_point: zero_point.clamp(quant_min, quant_max),
        }
    }
}

fn slice_min_max<I: Iterator<Item = f32>>(values: I) -> (f32, f32) {
    values.fold((f32::INFINITY, f32::NEG_INFINITY), |(min, max), v| {
        (min.min(v), max.max(v))
    })
}
