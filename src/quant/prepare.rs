use log::{debug, info};

use super::QConfig;
use crate::{
    arch::{
        layers::{Layer, QatConv2d},
        Sequential,
    },
    Result,
};

/// Swaps the float convolutions of `model` for their quantization aware variants.
///
/// # Arguments
/// * `model` - The float model. Its parameters end up shared with the returned one.
/// * `qconfig` - Attached to every convolution that has no qconfig of its own.
///
/// # Returns
/// The prepared model. Convolutions that end up without a qconfig are kept as they are, a fused
/// `ConvReLU2d` becomes a `QatConv2d` followed by a `ReLU`.
pub fn prepare_qat(model: Sequential, qconfig: Option<&QConfig>) -> Result<Sequential> {
    let mut layers = Vec::with_capacity(model.len());
    let mut converted = 0;

    for (i, mut layer) in model.into_layers().into_iter().enumerate() {
        if layer.qconfig().is_none() {
            if let Some(qconfig) = qconfig {
                attach(&mut layer, qconfig);
            }
        }

        match layer {
            Layer::Conv2d(_) | Layer::ConvReLU2d(_) if layer.qconfig().is_some() => {
                debug!(layer = i, kind:? = layer.kind(); "preparing layer for qat");
                let fused = matches!(layer, Layer::ConvReLU2d(_));

                layers.push(Layer::QatConv2d(QatConv2d::from_float(&layer, None)?));
                if fused {
                    layers.push(Layer::relu());
                }
                converted += 1;
            }
            layer => layers.push(layer),
        }
    }

    info!(converted = converted; "prepared model for quantization aware training");
    Ok(Sequential::new(layers))
}

fn attach(layer: &mut Layer, qconfig: &QConfig) {
    match layer {
        Layer::Conv2d(conv) => conv.set_qconfig(Some(qconfig.clone())),
        Layer::ConvReLU2d(fused) => fused.set_qconfig(Some(qconfig.clone())),
        Layer::ReLU(_) | Layer::QatConv2d(_) => {}
    }
}
