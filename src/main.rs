use std::{env, fs, num::NonZeroUsize};

use anyhow::Context;
use log::info;
use ndarray::{Array4, Axis};
use rand::{rngs::StdRng, Rng, SeedableRng};

use qat_conv::{
    arch::{
        build_model,
        layers::{Conv2dOptions, Layer, PaddingMode},
        loss::Mse,
    },
    optimization::GradientDescent,
    quant::{prepare_qat, QConfig},
    specs::{Conv2dSpec, LayerSpec, ModelSpec, TrainerSpec},
};

fn default_spec() -> TrainerSpec {
    let conv = |options| {
        LayerSpec::Conv2d(Conv2dSpec {
            options,
            qconfig: None,
        })
    };

    TrainerSpec {
        model: ModelSpec::Sequential {
            layers: vec![
                conv(
                    Conv2dOptions::new(1, 4, (3, 3))
                        .padding((1, 1))
                        .padding_mode(PaddingMode::Circular),
                ),
                LayerSpec::Relu,
                conv(Conv2dOptions::new(4, 1, (1, 1))),
            ],
        },
        qconfig: Some(QConfig::default_qat().to_spec()),
        learning_rate: 0.05,
        steps: NonZeroUsize::new(200).unwrap_or(NonZeroUsize::MIN),
        batch_size: NonZeroUsize::new(8).unwrap_or(NonZeroUsize::MIN),
        input_size: (6, 6),
        seed: Some(42),
    }
}

/// Random non negative samples and their targets, each sample rolled one column to the right.
fn synthetic_batch(
    rng: &mut StdRng,
    batch_size: usize,
    (h, w): (usize, usize),
) -> (Array4<f32>, Array4<f32>) {
    let x = Array4::from_shape_simple_fn((batch_size, 1, h, w), || rng.random::<f32>());

    let mut y = Array4::zeros(x.raw_dim());
    for j in 0..w {
        y.index_axis_mut(Axis(3), (j + 1) % w)
            .assign(&x.index_axis(Axis(3), j));
    }

    (x, y)
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let spec = match env::args().nth(1) {
        Some(path) => {
            let json = fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
            serde_json::from_str::<TrainerSpec>(&json)
                .with_context(|| format!("parsing {path}"))?
        }
        None => default_spec(),
    };

    let qconfig = spec.qconfig.map(QConfig::from_spec).transpose()?;
    let model = build_model(&spec.model, spec.seed)?;
    let mut model = prepare_qat(model, qconfig.as_ref())?;

    let mut rng = match spec.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };
    let mut optimizer = GradientDescent::new(spec.learning_rate);
    let loss_fn = Mse::new();

    for step in 0..spec.steps.get() {
        let (x, y) = synthetic_batch(&mut rng, spec.batch_size.get(), spec.input_size);
        let loss = model.backprop(&mut optimizer, &loss_fn, [(x.view(), y.view())])?;

        if step % 20 == 0 || step + 1 == spec.steps.get() {
            info!("step {step}: loss={loss:.6}");
        }
    }

    for (i, layer) in model.layers().iter().enumerate() {
        if let Layer::QatConv2d(conv) = layer {
            info!(
                "layer {i}: weight qparams={:?} activation qparams={:?}",
                conv.weight_fake_quant().qparams(),
                conv.activation_post_process().qparams()
            );
        }
    }

    Ok(())
}
