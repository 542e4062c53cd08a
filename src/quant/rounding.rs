//! Element-wise fake quantization kernels.

use serde::{Deserialize, Serialize};

/// How a scaled value is snapped onto the integer grid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundingMethod {
    /// Round to nearest, ties to even.
    #[default]
    HalfToEven,
    /// Round to nearest, ties away from zero.
    HalfAwayFromZero,
    Floor,
    Ceil,
    Trunc,
}

impl RoundingMethod {
    pub fn apply(self, x: f32) -> f32 {
        match self {
            RoundingMethod::HalfToEven => x.round_ties_even(),
            RoundingMethod::HalfAwayFromZero => x.round(),
            RoundingMethod::Floor => x.floor(),
            RoundingMethod::Ceil => x.ceil(),
            RoundingMethod::Trunc => x.trunc(),
        }
    }
}

/// The quantization parameters of a single slice (a whole tensor or one channel).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QParams {
    pub scale: f32,
    pub zero_point: i32,
}

impl Default for QParams {
    fn default() -> Self {
        Self {
            scale: 1.0,
            zero_point: 0,
        }
    }
}

/// Maps `x` onto the integer grid without clamping.
fn quantize_unclamped(x: f32, qparams: QParams, rounding: RoundingMethod) -> i64 {
    let inv_scale = 1.0 / qparams.scale;
    rounding.apply(x * inv_scale + qparams.zero_point as f32) as i64
}

/// Quantizes and immediately dequantizes `x`.
///
/// `(clamp(round(x / scale + zero_point), quant_min, quant_max) - zero_point) * scale`
pub fn fake_quantize_value(
    x: f32,
    qparams: QParams,
    quant_min: i32,
    quant_max: i32,
    rounding: RoundingMethod,
) -> f32 {
    let q = quantize_unclamped(x, qparams, rounding).clamp(quant_min as i64, quant_max as i64);
    (q - qparams.zero_point as i64) as f32 * qparams.scale
}

/// Straight-through gradient of [`fake_quantize_value`]: `dy` where the quantized value lands
/// inside `[quant_min, quant_max]` and zero where it was clamped.
pub fn fake_quantize_grad(
    x: f32,
    dy: f32,
    qparams: QParams,
    quant_min: i32,
    quant_max: i32,
    rounding: RoundingMethod,
) -> f32 {
    let q = quantize_unclamped(x, qparams, rounding);

    if q >= quant_min as i64 && q <= quant_max as i64 {
        dy
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn rounding_methods_disagree_on_ties() {
        assert_eq!(RoundingMethod::HalfToEven.apply(2.5), 2.0);
        assert_eq!(RoundingMethod::HalfAwayFromZero.apply(2.5), 3.0);
        assert_eq!(RoundingMethod::Floor.apply(-2.5), -3.0);
        assert_eq!(RoundingMethod::Ceil.apply(-2.5), -2.0);
        assert_eq!(RoundingMethod::Trunc.apply(-2.5), -2.0);
    }

    #[test]
    fn fake_quantize_value_clamps_to_range() {
        let qparams = QParams {
            scale: 0.5,
            zero_point: 0,
        };

        let v = fake_quantize_value(100.0, qparams, -128, 127, RoundingMethod::HalfToEven);
        assert_abs_diff_eq!(v, 63.5);

        let v = fake_quantize_value(-100.0, qparams, -128, 127, RoundingMethod::HalfToEven);
        assert_abs_diff_eq!(v, -64.0);
    }

    #[test]
    fn fake_quantize_value_respects_zero_point() {
        let qparams = QParams {
            scale: 0.1,
            zero_point: 10,
        };

        // 0.0 maps exactly onto the zero point.
        let v = fake_quantize_value(0.0, qparams, 0, 255, RoundingMethod::HalfToEven);
        assert_abs_diff_eq!(v, 0.0);

        // Values below -zero_point * scale are clamped at quant_min.
        let v = fake_quantize_value(-5.0, qparams, 0, 255, RoundingMethod::HalfToEven);
        assert_abs_diff_eq!(v, -1.0, epsilon = 1e-6);
    }

    #[test]
    fn grad_is_zero_outside_range() {
        let qparams = QParams::default();

        assert_eq!(
            fake_quantize_grad(3.0, 1.5, qparams, 0, 3, RoundingMethod::HalfToEven),
            1.5
        );
        assert_eq!(
            fake_quantize_grad(4.0, 1.5, qparams, 0, 3, RoundingMethod::HalfToEven),
            0.0
        );
        assert_eq!(
            fake_quantize_grad(-1.0, 1.5, qparams, 0, 3, RoundingMethod::HalfToEven),
            0.0
        );
    }

    proptest! {
        #![proptest_config(proptest::test_runner::Config::with_cases(200))]

        #[test]
        fn prop_output_lies_on_grid(
            x in -50.0f32..50.0,
            scale in 0.01f32..2.0,
            zero_point in -10i32..10,
        ) {
            let qparams = QParams { scale, zero_point };
            let v = fake_quantize_value(x, qparams, -128, 127, RoundingMethod::HalfToEven);

            let q = v / scale + zero_point as f32;
            prop_assert!((q - q.round()).abs() < 1e-3, "{v} is not on the grid of {scale}");
            prop_assert!(q.round() >= -128.0 && q.round() <= 127.0);
        }

        #[test]
        fn prop_in_range_error_is_at_most_half_a_step(
            x in -1.0f32..1.0,
        ) {
            let qparams = QParams { scale: 1.0 / 64.0, zero_point: 0 };
            let v = fake_quantize_value(x, qparams, -128, 127, RoundingMethod::HalfToEven);

            prop_assert!((v - x).abs() <= qparams.scale / 2.0 + 1e-6);
        }
    }
}
