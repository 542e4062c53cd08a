//! Fake quantization module for quantization aware training.
//!
//! Forward quantizes and dequantizes its input so the rest of the network sees the rounding and
//! clamping noise of a low precision representation. Backward is a clamped straight-through
//! estimator: gradients pass unchanged where the value was representable and are zeroed where it
//! was clamped.

use ndarray::{ArrayD, ArrayViewD, Axis, Zip};

use super::{
    fake_quantize_grad, fake_quantize_value, Observer, QParams, QuantRange, RoundingMethod,
};
use crate::{QatErr, Result};

#[derive(Debug, Clone)]
enum Simulation {
    Observed(Observer),
    Fixed(QParams),
    Identity,
}

/// A simulated quantization transform.
#[derive(Debug, Clone)]
pub struct FakeQuantize {
    simulation: Simulation,
    range: QuantRange,
    rounding: RoundingMethod,
    qparams: Vec<QParams>,
    observer_enabled: bool,
    fake_quant_enabled: bool,
}

impl FakeQuantize {
    /// Creates a `FakeQuantize` whose parameters are derived from the statistics gathered by
    /// `observer`.
    pub fn observed(observer: Observer, rounding: RoundingMethod) -> Self {
        Self {
            range: observer.range(),
            qparams: observer.calculate_qparams(),
            simulation: Simulation::Observed(observer),
            rounding,
            observer_enabled: true,
            fake_quant_enabled: true,
        }
    }

    /// Creates a `FakeQuantize` with constant parameters.
    ///
    /// # Returns
    /// An error if the scale isn't a positive finite number or the zero point is out of `range`.
    pub fn fixed(qparams: QParams, range: QuantRange, rounding: RoundingMethod) -> Result<Self> {
        if !(qparams.scale.is_finite() && qparams.scale > 0.0) {
            return Err(QatErr::InvalidConfig(format!(
                "fixed scale must be positive, got {}",
                qparams.scale
            )));
        }
        if qparams.zero_point < range.quant_min || qparams.zero_point > range.quant_max {
            return Err(QatErr::InvalidConfig(format!(
                "zero_point {} is outside [{}, {}]",
                qparams.zero_point, range.quant_min, range.quant_max
            )));
        }

        Ok(Self::fixed_unchecked(qparams, range, rounding))
    }

    /// [`FakeQuantize::fixed`] for parameters that were already validated, e.g. through
    /// `FakeQuantSpec::validate`.
    pub(crate) fn fixed_unchecked(
        qparams: QParams,
        range: QuantRange,
        rounding: RoundingMethod,
    ) -> Self {
        Self {
            simulation: Simulation::Fixed(qparams),
            range,
            rounding,
            qparams: vec![qparams],
            observer_enabled: false,
            fake_quant_enabled: true,
        }
    }

    /// A simulator that leaves values untouched.
    pub fn identity() -> Self {
        Self {
            simulation: Simulation::Identity,
            range: QuantRange::qint8(),
            rounding: RoundingMethod::default(),
            qparams: vec![QParams::default()],
            observer_enabled: false,
            fake_quant_enabled: false,
        }
    }

    pub fn is_identity(&self) -> bool {
        matches!(self.simulation, Simulation::Identity)
    }

    pub fn observer(&self) -> Option<&Observer> {
        match &self.simulation {
            Simulation::Observed(observer) => Some(observer),
            _ => None,
        }
    }

    pub fn range(&self) -> QuantRange {
        self.range
    }

    pub fn rounding(&self) -> RoundingMethod {
        self.rounding
    }

    /// The parameters the last forward pass quantized with.
    pub fn qparams(&self) -> &[QParams] {
        &self.qparams
    }

    /// Computes fresh parameters from the current state without running a forward pass.
    pub fn calculate_qparams(&self) -> Vec<QParams> {
        match &self.simulation {
            Simulation::Observed(observer) => observer.calculate_qparams(),
            Simulation::Fixed(qparams) => vec![*qparams],
            Simulation::Identity => vec![QParams::default()],
        }
    }

    /// Turns statistics gathering on or off. Has no effect on fixed or identity simulators.
    pub fn enable_observer(&mut self, enabled: bool) {
        self.observer_enabled = enabled && matches!(self.simulation, Simulation::Observed(_));
    }

    /// Turns the quantize-dequantize step on or off. Has no effect on identity simulators.
    pub fn enable_fake_quant(&mut self, enabled: bool) {
        self.fake_quant_enabled = enabled && !self.is_identity();
    }

    pub fn is_observer_enabled(&self) -> bool {
        self.observer_enabled
    }

    pub fn is_fake_quant_enabled(&self) -> bool {
        self.fake_quant_enabled
    }

    fn ch_axis(&self) -> Option<usize> {
        match &self.simulation {
            Simulation::Observed(observer) => observer.qscheme().ch_axis(),
            _ => None,
        }
    }

    /// Resolves the parameters of every slice along the channel axis. A single entry is
    /// broadcast, which happens when nothing has been observed yet.
    fn channel_qparams(&self, x: &ArrayViewD<f32>, ch_axis: usize) -> Result<Vec<QParams>> {
        if ch_axis >= x.ndim() {
            return Err(QatErr::ShapeMismatch {
                what: "fake quantize channel axis",
                got: x.shape().to_vec(),
                expected: vec![ch_axis + 1],
            });
        }

        let channels = x.len_of(Axis(ch_axis));
        match self.qparams.len() {
            1 => Ok(vec![self.qparams[0]; channels]),
            n if n == channels => Ok(self.qparams.clone()),
            n => Err(QatErr::ShapeMismatch {
                what: "fake quantize channels",
                got: vec![channels],
                expected: vec![n],
            }),
        }
    }

    /// Observes `x` (if enabled) and returns its fake quantized copy (if enabled).
    ///
    /// # Arguments
    /// * `x` - The tensor to simulate quantization on.
    ///
    /// # Returns
    /// The simulated tensor, with the same shape as `x`.
    pub fn forward(&mut self, x: ArrayViewD<f32>) -> Result<ArrayD<f32>> {
        if self.observer_enabled {
            if let Simulation::Observed(observer) = &mut self.simulation {
                observer.observe(x.view())?;
                self.qparams = observer.calculate_qparams();
            }
        }

        if !self.fake_quant_enabled {
            return Ok(x.to_owned());
        }

        let QuantRange {
            quant_min,
            quant_max,
        } = self.range;
        let rounding = self.rounding;

        let Some(ch_axis) = self.ch_axis() else {
            let qparams = self.qparams[0];
            return Ok(x.mapv(|v| fake_quantize_value(v, qparams, quant_min, quant_max, rounding)));
        };

        let per_channel = self.channel_qparams(&x, ch_axis)?;
        let mut out = x.to_owned();
        for (mut channel, qparams) in out.axis_iter_mut(Axis(ch_axis)).zip(per_channel) {
            channel.mapv_inplace(|v| fake_quantize_value(v, qparams, quant_min, quant_max, rounding));
        }

        Ok(out)
    }

    /// Straight-through estimator for the last forward pass.
    ///
    /// # Arguments
    /// * `x` - The tensor that was fed to `forward`.
    /// * `d` - The gradient with respect to `forward`'s output.
    ///
    /// # Returns
    /// The gradient with respect to `x`.
    pub fn backward(&self, x: ArrayViewD<f32>, d: ArrayViewD<f32>) -> Result<ArrayD<f32>> {
        if x.shape() != d.shape() {
            return Err(QatErr::ShapeMismatch {
                what: "fake quantize gradient",
                got: d.shape().to_vec(),
                expected: x.shape().to_vec(),
            });
        }

        if !self.fake_quant_enabled {
            return Ok(d.to_owned());
        }

        let QuantRange {
            quant_min,
            quant_max,
        } = self.range;
        let rounding = self.rounding;
        let mut grad = d.to_owned();

        let Some(ch_axis) = self.ch_axis() else {
            let qparams = self.qparams[0];
            Zip::from(&mut grad).and(&x).for_each(|g, &v| {
                *g = fake_quantize_grad(v, *g, qparams, quant_min, quant_max, rounding)
            });
            return Ok(grad);
        };

        let per_channel = self.channel_qparams(&x, ch_axis)?;
        let channels = grad
            .axis_iter_mut(Axis(ch_axis))
            .zip(x.axis_iter(Axis(ch_axis)))
            .zip(per_channel);

        for ((mut g_channel, x_channel), qparams) in channels {
            Zip::from(&mut g_channel).and(&x_channel).for_each(|g, &v| {
                *g = fake_quantize_grad(v, *g, qparams, quant_min, quant_max, rounding)
            });
        }

        Ok(grad)
    }
}
