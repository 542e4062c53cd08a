use approx::assert_abs_diff_eq;
use ndarray::{s, Array, Array1, Array4};
use proptest::prelude::*;
use rand::{rngs::StdRng, SeedableRng};

use qat_conv::{
    arch::{
        build_model,
        functional::{conv2d, ConvGeometry},
        layers::{Conv2d, Conv2dOptions, ConvReLU2d, Layer, LayerKind, PaddingMode, QatConv2d},
        loss::Mse,
        Param, Sequential,
    },
    optimization::GradientDescent,
    quant::{prepare_qat, QConfig, QuantRange, RoundingMethod},
    specs::{FakeQuantSpec, ModelSpec},
    QatErr,
};

fn identity_qconfig() -> QConfig {
    QConfig::new(FakeQuantSpec::Identity, FakeQuantSpec::Identity).unwrap()
}

fn fixed_qconfig() -> QConfig {
    let fixed = |scale| FakeQuantSpec::Fixed {
        scale,
        zero_point: 0,
        range: QuantRange::qint8(),
        rounding: RoundingMethod::HalfToEven,
    };

    QConfig::new(fixed(0.125), fixed(0.0625)).unwrap()
}

fn ramp(shape: (usize, usize, usize, usize)) -> Array4<f32> {
    Array::from_shape_fn(shape, |(n, c, h, w)| {
        ((n * 7 + c * 5 + h * 3 + w) % 11) as f32 * 0.2 - 1.0
    })
}

proptest! {
    #[test]
    fn construction_exposes_simulators(
        in_groups in 1usize..3,
        out_groups in 1usize..3,
        groups in 1usize..3,
        kh in 1usize..4,
        kw in 1usize..4,
        bias in any::<bool>(),
        circular in any::<bool>(),
    ) {
        let padding_mode = if circular { PaddingMode::Circular } else { PaddingMode::Zeros };
        let options = Conv2dOptions::new(in_groups * groups, out_groups * groups, (kh, kw))
            .groups(groups)
            .padding((kh / 2, kw / 2))
            .bias(bias)
            .padding_mode(padding_mode);

        let layer = QatConv2d::new(options, Some(QConfig::default_qat())).unwrap();

        prop_assert!(!layer.weight_fake_quant().is_identity());
        prop_assert!(!layer.activation_post_process().is_identity());
        prop_assert_eq!(layer.bias_fake_quant().is_some(), bias);
        prop_assert_eq!(layer.bias().is_some(), bias);
    }

    #[test]
    fn construction_without_qconfig_fails(
        in_channels in 1usize..4,
        out_channels in 1usize..4,
        k in 1usize..4,
    ) {
        let options = Conv2dOptions::new(in_channels, out_channels, (k, k));

        prop_assert!(matches!(
            QatConv2d::new(options, None),
            Err(QatErr::MissingQConfig)
        ));
    }
}

#[test]
fn forward_is_deterministic_with_fixed_simulators() {
    let options = Conv2dOptions::new(2, 3, (3, 3)).padding((1, 1));
    let mut layer =
        QatConv2d::new_with_rng(options, Some(fixed_qconfig()), &mut StdRng::seed_from_u64(5))
            .unwrap();
    let x = ramp((2, 2, 5, 5));

    let first = layer.forward(x.view()).unwrap();
    let second = layer.forward(x.view()).unwrap();

    assert_eq!(first, second);
    // Every output lies on the activation grid.
    assert!(first.iter().all(|v| (v / 0.125).fract() == 0.0));
}

#[test]
fn circular_padding_wraps_boundaries() {
    // Picks the top left tap, so each output is the padded input at the same position.
    let mut weight = Array4::zeros((1, 1, 3, 3));
    weight[[0, 0, 0, 0]] = 1.0;
    let options = Conv2dOptions::new(1, 1, (3, 3))
        .padding((1, 1))
        .bias(false)
        .padding_mode(PaddingMode::Circular);
    let mut layer = QatConv2d::with_params(
        options,
        Param::new(weight.clone()),
        None,
        Some(identity_qconfig()),
    )
    .unwrap();
    let x = Array::from_shape_fn((1, 1, 4, 4), |(_, _, h, w)| (h * 4 + w) as f32);

    let out = layer.forward(x.view()).unwrap();

    // A total padding of 1 puts the whole pad on the leading side.
    let mut zero_padded = Array4::zeros((1, 1, 5, 5));
    zero_padded.slice_mut(s![.., .., 1.., 1..]).assign(&x);
    let reference =
        conv2d(zero_padded.view(), weight.view(), None, ConvGeometry::default()).unwrap();
    assert_eq!(out.dim(), reference.dim());
    assert_eq!(out.dim(), (1, 1, 3, 3));

    // Wrapped from the opposite edges instead of zeros.
    assert_eq!(out[[0, 0, 0, 0]], x[[0, 0, 3, 3]]);
    assert_eq!(out[[0, 0, 0, 1]], x[[0, 0, 3, 0]]);
    assert_eq!(out[[0, 0, 1, 0]], x[[0, 0, 0, 3]]);
    assert_eq!(reference[[0, 0, 0, 0]], 0.0);
    // Away from the border both agree.
    assert_eq!(out[[0, 0, 1, 1]], reference[[0, 0, 1, 1]]);
}

#[test]
fn from_float_shares_parameters() {
    let conv = Conv2d::new(Conv2dOptions::new(2, 4, (3, 3)))
        .unwrap()
        .with_qconfig(QConfig::default_qat());
    let weight = conv.weight().clone();
    let bias = conv.bias().cloned().unwrap();
    let float = Layer::Conv2d(conv);

    let qat = QatConv2d::from_float(&float, None).unwrap();

    assert!(qat.weight().ptr_eq(&weight));
    assert!(qat.bias().unwrap().ptr_eq(&bias));
    assert_eq!(qat.qconfig(), &QConfig::default_qat());
    assert_eq!(qat.options(), float_options(&float));

    // Training the adapter updates the float layer.
    weight.write().fill(0.0);
    assert!(qat.weight().read().iter().all(|&w| w == 0.0));
}

fn float_options(layer: &Layer) -> &Conv2dOptions {
    match layer {
        Layer::Conv2d(conv) => conv.options(),
        _ => unreachable!(),
    }
}

#[test]
fn from_float_without_qconfig_fails() {
    let float = Layer::Conv2d(Conv2d::new(Conv2dOptions::new(1, 1, (1, 1))).unwrap());

    assert!(matches!(
        QatConv2d::from_float(&float, None),
        Err(QatErr::MissingQConfig)
    ));
    assert!(QatConv2d::from_float(&float, Some(identity_qconfig())).is_ok());
}

#[test]
fn from_float_rejects_unrelated_layers() {
    let err = QatConv2d::from_float(&Layer::relu(), Some(QConfig::default_qat())).unwrap_err();

    assert!(matches!(
        err,
        QatErr::TypeMismatch {
            expected: LayerKind::Conv2d,
            got: LayerKind::ReLU,
        }
    ));
    assert!(err.to_string().contains("ReLU"));
}

#[test]
fn from_float_unwraps_fused_conv_relu() {
    let conv = Conv2d::with_params(
        Conv2dOptions::new(1, 1, (1, 1)),
        Param::new(Array4::from_elem((1, 1, 1, 1), -1.0)),
        Some(Param::new(Array1::zeros(1))),
    )
    .unwrap();
    let weight = conv.weight().clone();
    let fused = Layer::ConvReLU2d(ConvReLU2d::new(conv).with_qconfig(identity_qconfig()));

    let mut qat = QatConv2d::from_float(&fused, None).unwrap();
    let out = qat.forward(Array4::ones((1, 1, 1, 1)).view()).unwrap();

    assert!(qat.weight().ptr_eq(&weight));
    // The activation is dropped.
    assert_eq!(out[[0, 0, 0, 0]], -1.0);
}

#[test]
fn qat_training_reduces_loss() {
    let spec: ModelSpec = serde_json::from_str(
        r#"{ "sequential": { "layers": [
            { "conv2d": { "in_channels": 1, "out_channels": 2, "kernel_size": [3, 3], "padding": [2, 2], "padding_mode": "circular" } },
            { "conv2d": { "in_channels": 2, "out_channels": 1, "kernel_size": [1, 1] } }
        ] } }"#,
    )
    .unwrap();
    let model = build_model(&spec, Some(1)).unwrap();
    let mut model: Sequential = prepare_qat(model, Some(&QConfig::default_qat())).unwrap();
    assert!(model.layers().iter().all(|l| l.kind() == LayerKind::QatConv2d));

    let x = ramp((4, 1, 4, 4));
    let y = x.mapv(|v| 0.5 * v);
    let mut optimizer = GradientDescent::new(0.05);

    let first = model
        .backprop(&mut optimizer, &Mse::new(), [(x.view(), y.view())])
        .unwrap();
    let mut last = first;
    for _ in 0..60 {
        last = model
            .backprop(&mut optimizer, &Mse::new(), [(x.view(), y.view())])
            .unwrap();
    }

    assert!(last < first, "loss went from {first} to {last}");
}

#[test]
fn disabling_simulation_recovers_float_model() {
    let options = Conv2dOptions::new(1, 2, (3, 3)).padding((1, 1));
    let float = Conv2d::new_with_rng(options, &mut StdRng::seed_from_u64(9))
        .unwrap()
        .with_qconfig(QConfig::per_channel_qat());
    let mut reference = float.clone();
    let mut model = prepare_qat(Sequential::new([Layer::Conv2d(float)]), None).unwrap();
    let x = ramp((1, 1, 4, 4));

    model.enable_fake_quant(false);
    let y = model.forward(x.view()).unwrap();
    let expected = reference.forward(x.view()).unwrap();

    for (a, b) in y.iter().zip(&expected) {
        assert_abs_diff_eq!(a, b, epsilon = 1e-6);
    }
}
