use log::debug;
use ndarray::{Array1, Array4, ArrayView1, ArrayView4, Ix1, Ix4};
use rand::Rng;

use super::{Conv2dOptions, LayerKind, PaddingMode};
use crate::{
    arch::{
        functional::{self, CircularPad, ConvGrads},
        init, Param,
    },
    optimization::Optimizer,
    quant::QConfig,
    QatErr, Result,
};

/// The gradients of a convolution layer's parameters, left by its last backward pass.
#[derive(Debug, Clone)]
pub struct ParamGrads {
    pub weight: Array4<f32>,
    pub bias: Option<Array1<f32>>,
}

/// Runs the convolution of a layer configured with `options`. In circular mode the input is
/// wrapped around by hand and the primitive runs without padding.
pub(super) fn conv_forward(
    options: &Conv2dOptions,
    x: ArrayView4<f32>,
    weight: ArrayView4<f32>,
    bias: Option<ArrayView1<f32>>,
) -> Result<Array4<f32>> {
    match options.padding_mode {
        PaddingMode::Zeros => functional::conv2d(x, weight, bias, options.geometry()),
        PaddingMode::Circular => {
            let padded = functional::pad_circular(x, CircularPad::from_padding(options.padding))?;
            functional::conv2d(padded.view(), weight, bias, options.geometry())
        }
    }
}

/// Gradients of [`conv_forward`], with the input gradient mapped back onto the unpadded input.
pub(super) fn conv_backward(
    options: &Conv2dOptions,
    x: ArrayView4<f32>,
    weight: ArrayView4<f32>,
    d: ArrayView4<f32>,
) -> Result<ConvGrads> {
    match options.padding_mode {
        PaddingMode::Zeros => functional::conv2d_backward(x, weight, d, options.geometry()),
        PaddingMode::Circular => {
            let pad = CircularPad::from_padding(options.padding);
            let padded = functional::pad_circular(x, pad)?;
            let mut grads =
                functional::conv2d_backward(padded.view(), weight, d, options.geometry())?;

            let (_, _, h, w) = x.dim();
            grads.input = functional::pad_circular_backward(grads.input.view(), pad, (h, w))?;
            Ok(grads)
        }
    }
}

/// Checks that `weight` and `bias` fit the geometry in `options`.
pub(super) fn check_params(
    options: &Conv2dOptions,
    weight: &Param<Ix4>,
    bias: Option<&Param<Ix1>>,
) -> Result<()> {
    options.validate()?;

    let (o, i, kh, kw) = options.weight_shape();
    let expected = vec![o, i, kh, kw];
    let got = weight.shape();
    if got != expected {
        return Err(QatErr::ShapeMismatch {
            what: "conv2d weight",
            got,
            expected,
        });
    }

    match bias {
        Some(bias) if bias.shape() != [options.out_channels] => Err(QatErr::ShapeMismatch {
            what: "conv2d bias",
            got: bias.shape(),
            expected: vec![options.out_channels],
        }),
        Some(_) if !options.bias => Err(QatErr::InvalidGeometry(
            "got a bias for a layer configured without one".into(),
        )),
        None if options.bias => Err(QatErr::InvalidGeometry(
            "missing the bias of a layer configured with one".into(),
        )),
        _ => Ok(()),
    }
}

/// A standard (float) 2D convolution layer.
#[derive(Debug, Clone)]
pub struct Conv2d {
    options: Conv2dOptions,
    weight: Param<Ix4>,
    bias: Option<Param<Ix1>>,
    qconfig: Option<QConfig>,

    // Forward metadata
    x: Option<Array4<f32>>,

    // Backward metadata
    grad: Option<ParamGrads>,
}

impl Conv2d {
    pub const KIND: LayerKind = LayerKind::Conv2d;

    /// Creates a new `Conv2d` with randomly initialized parameters.
    pub fn new(options: Conv2dOptions) -> Result<Self> {
        Self::new_with_rng(options, &mut rand::rng())
    }

    /// Creates a new `Conv2d`, drawing its parameters from `rng`.
    pub fn new_with_rng<R: Rng + ?Sized>(options: Conv2dOptions, rng: &mut R) -> Result<Self> {
        options.validate()?;
        let (weight, bias) = init::conv_params(&options, rng)?;
        Self::with_params(options, Param::new(weight), bias.map(Param::new))
    }

    /// Creates a new `Conv2d` around existing (possibly shared) parameters.
    ///
    /// # Returns
    /// An error if the parameters don't fit the geometry.
    pub fn with_params(
        options: Conv2dOptions,
        weight: Param<Ix4>,
        bias: Option<Param<Ix1>>,
    ) -> Result<Self> {
        check_params(&options, &weight, bias.as_ref())?;

        Ok(Self {
            options,
            weight,
            bias,
            qconfig: None,
            x: None,
            grad: None,
        })
    }

    /// Attaches a qconfig, marking the layer for quantization aware training.
    pub fn with_qconfig(mut self, qconfig: QConfig) -> Self {
        self.qconfig = Some(qconfig);
        self
    }

    pub fn set_qconfig(&mut self, qconfig: Option<QConfig>) {
        self.qconfig = qconfig;
    }

    pub fn qconfig(&self) -> Option<&QConfig> {
        self.qconfig.as_ref()
    }

    pub fn options(&self) -> &Conv2dOptions {
        &self.options
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

    /// Replaces the bias handle, or removes the bias.
    pub fn set_bias(&mut self, bias: Option<Param<Ix1>>) -> Result<()> {
        let options = self.options.clone().bias(bias.is_some());
        check_params(&options, &self.weight, bias.as_ref())?;
        self.options = options;
        self.bias = bias;
        Ok(())
    }

    pub fn grad(&self) -> Option<&ParamGrads> {
        self.grad.as_ref()
    }

    /// Convolves `x`, caching it for the backward pass.
    pub fn forward(&mut self, x: ArrayView4<f32>) -> Result<Array4<f32>> {
        let out = {
            let weight = self.weight.read();
            let bias = self.bias.as_ref().map(|b| b.read());
            conv_forward(
                &self.options,
                x,
                weight.view(),
                bias.as_ref().map(|b| b.view()),
            )?
        };

        self.x = Some(x.to_owned());
        Ok(out)
    }

    /// Computes the gradients of the last forward pass.
    ///
    /// # Arguments
    /// * `d` - The gradient with respect to this layer's output.
    ///
    /// # Returns
    /// The gradient with respect to this layer's input.
    pub fn backward(&mut self, d: ArrayView4<f32>) -> Result<Array4<f32>> {
        let x = self.x.as_ref().ok_or(QatErr::MissingForward(Self::KIND))?;

        let grads = {
            let weight = self.weight.read();
            conv_backward(&self.options, x.view(), weight.view(), d)?
        };

        self.grad = Some(ParamGrads {
            weight: grads.weight,
            bias: self.bias.is_some().then_some(grads.bias),
        });

        Ok(grads.input)
    }

    /// Applies the gradients of the last backward pass.
    pub fn step<O: Optimizer>(&mut self, optimizer: &mut O) {
        let Some(grad) = self.grad.take() else {
            debug!("conv2d step without gradients, skipping");
            return;
        };

        apply_grads(optimizer, &self.weight, self.bias.as_ref(), grad);
    }
}

pub(super) fn apply_grads<O: Optimizer>(
    optimizer: &mut O,
    weight: &Param<Ix4>,
    bias: Option<&Param<Ix1>>,
    grad: ParamGrads,
) {
    optimizer.update_params(
        weight.write().view_mut().into_dyn(),
        grad.weight.view().into_dyn(),
    );

    if let (Some(bias), Some(db)) = (bias, grad.bias) {
        optimizer.update_params(bias.write().view_mut().into_dyn(), db.view().into_dyn());
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use ndarray::{arr1, Array};

    use super::*;
    use crate::optimization::GradientDescent;

    fn conv(options: Conv2dOptions, weight: Vec<f32>, bias: Option<Vec<f32>>) -> Conv2d {
        let shape = options.weight_shape();
        Conv2d::with_params(
            options,
            Param::new(Array::from_shape_vec(shape, weight).unwrap()),
            bias.map(|b| Param::new(Array1::from(b))),
        )
        .unwrap()
    }

    #[test]
    fn random_init_matches_geometry() {
        let layer = Conv2d::new(Conv2dOptions::new(3, 6, (3, 3)).groups(3)).unwrap();

        assert_eq!(layer.weight().shape(), vec![6, 1, 3, 3]);
        assert_eq!(layer.bias().unwrap().shape(), vec![6]);
        assert!(layer.qconfig().is_none());
    }

    #[test]
    fn with_params_rejects_wrong_shapes() {
        let options = Conv2dOptions::new(1, 2, (3, 3));

        let weight = Param::new(Array4::zeros((2, 1, 2, 2)));
        let err = Conv2d::with_params(options.clone(), weight, None);
        assert!(matches!(err, Err(QatErr::ShapeMismatch { .. })));

        let weight = Param::new(Array4::zeros((2, 1, 3, 3)));
        let bias = Param::new(Array1::zeros(2));
        let err = Conv2d::with_params(options.bias(false), weight, Some(bias));
        assert!(matches!(err, Err(QatErr::InvalidGeometry(_))));
    }

    #[test]
    fn circular_forward_wraps_input() {
        let options = Conv2dOptions::new(1, 1, (1, 2))
            .padding((0, 1))
            .bias(false)
            .padding_mode(PaddingMode::Circular);
        let mut layer = conv(options, vec![1.0, 1.0], None);
        let x = Array::from_shape_vec((1, 1, 1, 3), vec![1.0, 2.0, 3.0]).unwrap();

        let out = layer.forward(x.view()).unwrap();

        // Padded row is [3, 1, 2, 3].
        assert_eq!(out.into_raw_vec_and_offset().0, vec![4.0, 3.0, 5.0]);
    }

    #[test]
    fn backward_before_forward_fails() {
        let mut layer = conv(Conv2dOptions::new(1, 1, (1, 1)), vec![1.0], Some(vec![0.0]));

        assert!(matches!(
            layer.backward(Array4::zeros((1, 1, 1, 1)).view()),
            Err(QatErr::MissingForward(LayerKind::Conv2d))
        ));
    }

    #[test]
    fn circular_backward_folds_gradient() {
        let options = Conv2dOptions::new(1, 1, (1, 2))
            .padding((0, 1))
            .bias(false)
            .padding_mode(PaddingMode::Circular);
        let mut layer = conv(options, vec![1.0, 1.0], None);
        let x = Array::from_shape_vec((1, 1, 1, 3), vec![1.0, 2.0, 3.0]).unwrap();

        layer.forward(x.view()).unwrap();
        let dx = layer.backward(Array4::ones((1, 1, 1, 3)).view()).unwrap();

        // Every input element is read by exactly two output positions.
        assert_eq!(dx.into_raw_vec_and_offset().0, vec![2.0, 2.0, 2.0]);
        assert!(layer.grad().unwrap().bias.is_none());
    }

    #[test]
    fn step_updates_shared_weight() {
        let mut layer = conv(Conv2dOptions::new(1, 1, (1, 1)), vec![1.0], Some(vec![0.0]));
        let shared = layer.weight().clone();
        let x = Array::from_shape_vec((1, 1, 1, 2), vec![1.0, 3.0]).unwrap();

        layer.forward(x.view()).unwrap();
        layer.backward(Array4::ones((1, 1, 1, 2)).view()).unwrap();
        layer.step(&mut GradientDescent::new(0.1));

        // dw = 1 + 3, db = 2
        assert_abs_diff_eq!(shared.read()[[0, 0, 0, 0]], 0.6, epsilon = 1e-6);
        assert_eq!(layer.bias().unwrap().to_owned_array(), arr1(&[-0.2]));
        assert!(layer.grad().is_none());
    }
}
