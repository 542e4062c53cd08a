//! Quantization aware training variant of [`Conv2d`].
//!
//! Same interface as the float layer, with `FakeQuantize` modules simulating the quantization of
//! the weight, the bias (if any) and the output activation:
//!
//! ```text
//! out = activation_post_process(conv(x, weight_fake_quant(w), bias_fake_quant(b)))
//! ```

use log::debug;
use ndarray::{Array1, Array4, ArrayView4, Ix1, Ix4};
use rand::Rng;

use super::{
    conv2d::{apply_grads, check_params, conv_backward, conv_forward},
    Conv2d, Conv2dOptions, Layer, LayerKind, ParamGrads,
};
use crate::{
    arch::{init, Param},
    optimization::Optimizer,
    quant::{FakeQuantize, QConfig},
    QatErr, Result,
};

/// What the backward pass needs from the last forward pass.
#[derive(Debug, Clone)]
struct Cache {
    x: Array4<f32>,
    weight: Array4<f32>,
    fq_weight: Array4<f32>,
    bias: Option<Array1<f32>>,
    bias_quantized: bool,
    conv_out: Array4<f32>,
}

/// A 2D convolution with fake quantization on its weight, bias and output, used for quantization
/// aware training.
#[derive(Debug, Clone)]
pub struct QatConv2d {
    options: Conv2dOptions,
    weight: Param<Ix4>,
    bias: Option<Param<Ix1>>,
    qconfig: QConfig,

    activation_post_process: FakeQuantize,
    weight_fake_quant: FakeQuantize,
    bias_fake_quant: Option<FakeQuantize>,

    cache: Option<Cache>,
    grad: Option<ParamGrads>,
}

impl QatConv2d {
    pub const KIND: LayerKind = LayerKind::QatConv2d;

    /// The only kind of float layer `from_float` converts.
    pub const FLOAT_MODULE: LayerKind = Conv2d::KIND;

    /// Creates a new `QatConv2d` with randomly initialized parameters.
    ///
    /// # Returns
    /// `QatErr::MissingQConfig` if `qconfig` is `None`, or an error if the geometry is invalid.
    pub fn new(options: Conv2dOptions, qconfig: Option<QConfig>) -> Result<Self> {
        Self::new_with_rng(options, qconfig, &mut rand::rng())
    }

    /// Creates a new `QatConv2d`, drawing its parameters from `rng`.
    pub fn new_with_rng<R: Rng + ?Sized>(
        options: Conv2dOptions,
        qconfig: Option<QConfig>,
        rng: &mut R,
    ) -> Result<Self> {
        let qconfig = qconfig.ok_or(QatErr::MissingQConfig)?;
        options.validate()?;

        let (weight, bias) = init::conv_params(&options, rng)?;
        Self::with_params(options, Param::new(weight), bias.map(Param::new), Some(qconfig))
    }

    /// Creates a new `QatConv2d` around existing (possibly shared) parameters.
    ///
    /// # Arguments
    /// * `options` - The geometry of the layer.
    /// * `weight` - The weight, shaped `(out_channels, in_channels / groups, kh, kw)`.
    /// * `bias` - The bias, required iff `options.bias` is set.
    /// * `qconfig` - Provides the simulators.
    ///
    /// # Returns
    /// `QatErr::MissingQConfig` if `qconfig` is `None`, or an error if the parameters don't fit
    /// the geometry.
    pub fn with_params(
        options: Conv2dOptions,
        weight: Param<Ix4>,
        bias: Option<Param<Ix1>>,
        qconfig: Option<QConfig>,
    ) -> Result<Self> {
        let qconfig = qconfig.ok_or(QatErr::MissingQConfig)?;
        check_params(&options, &weight, bias.as_ref())?;

        // There is no bias recipe, the bias is simulated like a weight.
        let bias_fake_quant = options.bias.then(|| qconfig.weight());

        Ok(Self {
            activation_post_process: qconfig.activation(),
            weight_fake_quant: qconfig.weight(),
            bias_fake_quant,
            options,
            weight,
            bias,
            qconfig,
            cache: None,
            grad: None,
        })
    }

    /// Creates a `QatConv2d` from a float convolution, sharing its weight and bias.
    ///
    /// A fused `ConvReLU2d` is accepted too, in which case only its convolution is converted and
    /// the activation is dropped.
    ///
    /// # Arguments
    /// * `layer` - The float layer. It isn't modified.
    /// * `qconfig` - Overrides the qconfig attached to `layer`.
    ///
    /// # Returns
    /// `QatErr::TypeMismatch` if `layer` is not a `Conv2d` (or `ConvReLU2d`), and
    /// `QatErr::MissingQConfig` if no qconfig is given and `layer` has none attached.
    pub fn from_float(layer: &Layer, qconfig: Option<QConfig>) -> Result<Self> {
        let (conv, attached) = match layer {
            Layer::ConvReLU2d(fused) => (
                fused.first(),
                fused.qconfig().or(fused.first().qconfig()),
            ),
            Layer::Conv2d(conv) => (conv, conv.qconfig()),
            other => {
                return Err(QatErr::TypeMismatch {
                    expected: Self::FLOAT_MODULE,
                    got: other.kind(),
                })
            }
        };

        let qconfig = qconfig
            .or_else(|| attached.cloned())
            .ok_or(QatErr::MissingQConfig)?;

        debug!(
            from:? = layer.kind(),
            bias = conv.bias().is_some();
            "converting float convolution to qat"
        );

        let options = conv.options().clone().bias(conv.bias().is_some());
        Self::with_params(
            options,
            conv.weight().clone(),
            conv.bias().cloned(),
            Some(qconfig),
        )
    }

    pub fn options(&self) -> &Conv2dOptions {
        &self.options
    }

    pub fn qconfig(&self) -> &QConfig {
        &self.qconfig
    }

    pub fn weight(&self) -> &Param<Ix4> {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Param<Ix1>> {
        self.bias.as_ref()
    }

    /// Replaces the weight handle. Any layer that shared the old one keeps it.
    pub fn set_weight(&mut self, weight: Param<Ix4>) -> Result<()> {
        check_params(&self.options, &weight, self.bias.as_ref())?;
        self.weight = weight;
        Ok(())
    }

    /// The simulator applied to the convolution's output.
    pub fn activation_post_process(&self) -> &FakeQuantize {
        &self.activation_post_process
    }

    pub fn weight_fake_quant(&self) -> &FakeQuantize {
        &self.weight_fake_quant
    }

    pub fn bias_fake_quant(&self) -> Option<&FakeQuantize> {
        self.bias_fake_quant.as_ref()
    }

    fn fake_quants_mut(&mut self) -> impl Iterator<Item = &mut FakeQuantize> {
        [
            Some(&mut self.activation_post_process),
            Some(&mut self.weight_fake_quant),
            self.bias_fake_quant.as_mut(),
        ]
        .into_iter()
        .flatten()
    }

    /// Turns statistics gathering on or off in every simulator of this layer.
    pub fn enable_observer(&mut self, enabled: bool) {
        self.fake_quants_mut()
            .for_each(|fq| fq.enable_observer(enabled));
    }

    /// Turns fake quantization on or off in every simulator of this layer.
    pub fn enable_fake_quant(&mut self, enabled: bool) {
        self.fake_quants_mut()
            .for_each(|fq| fq.enable_fake_quant(enabled));
    }

    pub fn grad(&self) -> Option<&ParamGrads> {
        self.grad.as_ref()
    }

    /// Makes a forward pass with simulated quantization.
    ///
    /// # Arguments
    /// * `x` - The input, shaped `(n, in_channels, h, w)`.
    ///
    /// # Returns
    /// The fake quantized output of the convolution.
    pub fn forward(&mut self, x: ArrayView4<f32>) -> Result<Array4<f32>> {
        let weight = self.weight.to_owned_array();
        let fq_weight = self
            .weight_fake_quant
            .forward(weight.view().into_dyn())?
            .into_dimensionality::<Ix4>()?;

        let bias = self.bias.as_ref().map(Param::to_owned_array);
        let fq_bias = match (&mut self.bias_fake_quant, &bias) {
            (Some(fq), Some(b)) => Some(
                fq.forward(b.view().into_dyn())?
                    .into_dimensionality::<Ix1>()?,
            ),
            _ => None,
        };

        let conv_out = conv_forward(
            &self.options,
            x,
            fq_weight.view(),
            fq_bias.as_ref().or(bias.as_ref()).map(|b| b.view()),
        )?;

        let out = self
            .activation_post_process
            .forward(conv_out.view().into_dyn())?
            .into_dimensionality::<Ix4>()?;

        self.cache = Some(Cache {
            x: x.to_owned(),
            weight,
            fq_weight,
            bias,
            bias_quantized: fq_bias.is_some(),
            conv_out,
        });

        Ok(out)
    }

    /// Computes the gradients of the last forward pass, passing them straight through every
    /// simulator except where it clamped.
    ///
    /// # Arguments
    /// * `d` - The gradient with respect to this layer's output.
    ///
    /// # Returns
    /// The gradient with respect to this layer's input.
    pub fn backward(&mut self, d: ArrayView4<f32>) -> Result<Array4<f32>> {
        let cache = self
            .cache
            .as_ref()
            .ok_or(QatErr::MissingForward(Self::KIND))?;

        let d_conv = self
            .activation_post_process
            .backward(cache.conv_out.view().into_dyn(), d.into_dyn())?
            .into_dimensionality::<Ix4>()?;

        let grads = conv_backward(
            &self.options,
            cache.x.view(),
            cache.fq_weight.view(),
            d_conv.view(),
        )?;

        let weight = self
            .weight_fake_quant
            .backward(cache.weight.view().into_dyn(), grads.weight.view().into_dyn())?
            .into_dimensionality::<Ix4>()?;

        let bias = match (&cache.bias, &self.bias_fake_quant) {
            (Some(b), Some(fq)) if cache.bias_quantized => Some(
                fq.backward(b.view().into_dyn(), grads.bias.view().into_dyn())?
                    .into_dimensionality::<Ix1>()?,
            ),
            (Some(_), _) => Some(grads.bias),
            (None, _) => None,
        };

        self.grad = Some(ParamGrads { weight, bias });
        Ok(grads.input)
    }

    /// Applies the gradients of the last backward pass to the float weight and bias.
    pub fn step<O: Optimizer>(&mut self, optimizer: &mut O) {
        let Some(grad) = self.grad.take() else {
            debug!("qat conv2d step without gradients, skipping");
            return;
        };

        apply_grads(optimizer, &self.weight, self.bias.as_ref(), grad);
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use ndarray::{arr1, Array};

    use super::*;
    use crate::{
        arch::layers::{ConvReLU2d, PaddingMode},
        quant::{QuantRange, RoundingMethod},
        specs::FakeQuantSpec,
    };

    fn fixed(scale: f32) -> FakeQuantSpec {
        FakeQuantSpec::Fixed {
            scale,
            zero_point: 0,
            range: QuantRange::qint8(),
            rounding: RoundingMethod::HalfToEven,
        }
    }

    fn fixed_qconfig() -> QConfig {
        QConfig::new(fixed(0.25), fixed(0.5)).unwrap()
    }

    fn qat(options: Conv2dOptions, weight: Vec<f32>, bias: Option<Vec<f32>>) -> QatConv2d {
        let shape = options.weight_shape();
        QatConv2d::with_params(
            options,
            Param::new(Array::from_shape_vec(shape, weight).unwrap()),
            bias.map(|b| Param::new(Array1::from(b))),
            Some(fixed_qconfig()),
        )
        .unwrap()
    }

    #[test]
    fn bias_simulator_follows_bias_flag() {
        let with_bias =
            QatConv2d::new(Conv2dOptions::new(2, 4, (3, 3)), Some(QConfig::default_qat())).unwrap();
        let without = QatConv2d::new(
            Conv2dOptions::new(2, 4, (3, 3)).bias(false),
            Some(QConfig::default_qat()),
        )
        .unwrap();

        assert!(with_bias.bias_fake_quant().is_some());
        assert!(without.bias_fake_quant().is_none());
        assert!(without.bias().is_none());
        assert_eq!(with_bias.qconfig(), &QConfig::default_qat());
    }

    #[test]
    fn bias_simulator_comes_from_weight_factory() {
        let layer = qat(Conv2dOptions::new(1, 1, (1, 1)), vec![1.0], Some(vec![0.0]));

        assert_eq!(layer.bias_fake_quant().unwrap().qparams()[0].scale, 0.5);
        assert_eq!(layer.weight_fake_quant().qparams()[0].scale, 0.5);
        assert_eq!(layer.activation_post_process().qparams()[0].scale, 0.25);
    }

    #[test]
    fn forward_quantizes_weight_bias_and_output() {
        let mut layer = qat(Conv2dOptions::new(1, 1, (1, 1)), vec![0.7], Some(vec![0.3]));
        let x = Array::from_shape_vec((1, 1, 1, 2), vec![1.0, 0.6]).unwrap();

        let out = layer.forward(x.view()).unwrap();

        // w: 0.7 -> 0.5, b: 0.3 -> 0.5, conv: [1.0, 0.8], output grid of 0.25: [1.0, 0.75]
        assert_eq!(out.into_raw_vec_and_offset().0, vec![1.0, 0.75]);
    }

    #[test]
    fn forward_without_bias_skips_bias_simulation() {
        let mut layer = qat(Conv2dOptions::new(1, 1, (1, 1)).bias(false), vec![0.7], None);
        let x = Array::from_shape_vec((1, 1, 1, 1), vec![1.0]).unwrap();

        let out = layer.forward(x.view()).unwrap();

        assert_eq!(out[[0, 0, 0, 0]], 0.5);
    }

    #[test]
    fn backward_masks_clamped_outputs() {
        let mut layer = qat(Conv2dOptions::new(1, 1, (1, 1)).bias(false), vec![1.0], None);
        // The output grid tops out at 127 * 0.25 = 31.75.
        let x = Array::from_shape_vec((1, 1, 1, 2), vec![1.0, 100.0]).unwrap();

        layer.forward(x.view()).unwrap();
        let dx = layer.backward(Array4::ones((1, 1, 1, 2)).view()).unwrap();

        assert_eq!(dx.into_raw_vec_and_offset().0, vec![1.0, 0.0]);
        assert_abs_diff_eq!(layer.grad().unwrap().weight[[0, 0, 0, 0]], 1.0);
    }

    #[test]
    fn step_trains_the_float_weight() {
        let mut layer = qat(Conv2dOptions::new(1, 1, (1, 1)), vec![1.0], Some(vec![0.0]));
        let x = Array::from_shape_vec((1, 1, 1, 1), vec![2.0]).unwrap();

        layer.forward(x.view()).unwrap();
        layer.backward(Array4::ones((1, 1, 1, 1)).view()).unwrap();
        layer.step(&mut crate::optimization::GradientDescent::new(0.1));

        assert_abs_diff_eq!(layer.weight().read()[[0, 0, 0, 0]], 0.8, epsilon = 1e-6);
        assert_eq!(layer.bias().unwrap().to_owned_array(), arr1(&[-0.1]));
    }

    #[test]
    fn disabled_fake_quant_matches_float_conv() {
        let options = Conv2dOptions::new(2, 3, (3, 3))
            .padding((1, 1))
            .padding_mode(PaddingMode::Circular);
        let mut layer = QatConv2d::new(options, Some(QConfig::default_qat())).unwrap();
        layer.enable_fake_quant(false);

        let mut float = Conv2d::with_params(
            layer.options().clone(),
            layer.weight().clone(),
            layer.bias().cloned(),
        )
        .unwrap();
        let x = Array::from_shape_fn((2, 2, 4, 5), |(n, c, h, w)| {
            (n + c * h) as f32 - w as f32 * 0.3
        });

        assert_eq!(layer.forward(x.view()).unwrap(), float.forward(x.view()).unwrap());
    }

    #[test]
    fn from_float_rejects_qat_layers() {
        let layer = Layer::QatConv2d(qat(
            Conv2dOptions::new(1, 1, (1, 1)),
            vec![1.0],
            Some(vec![0.0]),
        ));

        assert!(matches!(
            QatConv2d::from_float(&layer, Some(fixed_qconfig())),
            Err(QatErr::TypeMismatch {
                expected: LayerKind::Conv2d,
                got: LayerKind::QatConv2d,
            })
        ));
    }

    #[test]
    fn from_float_prefers_the_override() {
        let conv = Conv2d::new(Conv2dOptions::new(1, 1, (1, 1)))
            .unwrap()
            .with_qconfig(QConfig::default_qat());
        let layer = Layer::Conv2d(conv);

        let converted = QatConv2d::from_float(&layer, Some(fixed_qconfig())).unwrap();

        assert_eq!(converted.qconfig(), &fixed_qconfig());
    }

    #[test]
    fn from_float_reads_the_fused_units_qconfig() {
        let conv = Conv2d::new(Conv2dOptions::new(1, 2, (1, 1))).unwrap();
        let layer = Layer::ConvReLU2d(ConvReLU2d::new(conv).with_qconfig(fixed_qconfig()));

        let converted = QatConv2d::from_float(&layer, None).unwrap();

        assert_eq!(converted.qconfig(), &fixed_qconfig());
    }

    #[test]
    fn set_weight_ends_sharing() {
        let conv = Conv2d::new(Conv2dOptions::new(1, 1, (2, 2)))
            .unwrap()
            .with_qconfig(fixed_qconfig());
        let layer = Layer::Conv2d(conv);
        let mut converted = QatConv2d::from_float(&layer, None).unwrap();

        converted
            .set_weight(Param::new(Array4::zeros((1, 1, 2, 2))))
            .unwrap();

        let Layer::Conv2d(conv) = &layer else {
            unreachable!()
        };
        assert!(!converted.weight().ptr_eq(conv.weight()));
        assert!(converted.bias().unwrap().ptr_eq(conv.bias().unwrap()));
    }
}
