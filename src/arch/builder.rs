use log::debug;
use rand::{rngs::StdRng, SeedableRng};

use super::{
    layers::{Conv2d, ConvReLU2d, Layer},
    Sequential,
};
use crate::{
    quant::QConfig,
    specs::{Conv2dSpec, LayerSpec, ModelSpec},
    Result,
};

/// Builds `Sequential` models given a specification.
#[derive(Debug, Default)]
pub struct ModelBuilder;

impl ModelBuilder {
    /// Creates a new `ModelBuilder`.
    pub fn new() -> Self {
        Self
    }

    /// Builds a new model following a spec.
    ///
    /// # Arguments
    /// * `spec` - The specification for the model.
    /// * `seed` - Seeds the parameter initialization, drawn from the OS if `None`.
    ///
    /// # Returns
    /// The model, or an error if any layer or qconfig in the spec is invalid.
    pub fn build(&self, spec: &ModelSpec, seed: Option<u64>) -> Result<Sequential> {
        let mut rng = self.generate_rng(seed);

        match spec {
            ModelSpec::Sequential {
                layers: layer_specs,
            } => {
                let layers = layer_specs
                    .iter()
                    .map(|ls| self.resolve_layer(ls, &mut rng))
                    .collect::<Result<Vec<_>>>()?;

                debug!(layers = layers.len(), seed:? = seed; "built sequential model");
                Ok(Sequential::new(layers))
            }
        }
    }

    fn resolve_layer(&self, spec: &LayerSpec, rng: &mut StdRng) -> Result<Layer> {
        let layer = match spec {
            LayerSpec::Conv2d(conv) => Layer::Conv2d(self.resolve_conv(conv, rng)?),
            LayerSpec::ConvRelu2d(conv) => {
                let conv = self.resolve_conv(conv, rng)?;
                let qconfig = conv.qconfig().cloned();
                let mut fused = ConvReLU2d::new(conv);
                fused.set_qconfig(qconfig);
                Layer::ConvReLU2d(fused)
            }
            LayerSpec::Relu => Layer::relu(),
        };

        Ok(layer)
    }

    fn resolve_conv(&self, spec: &Conv2dSpec, rng: &mut StdRng) -> Result<Conv2d> {
        let mut conv = Conv2d::new_with_rng(spec.options.clone(), rng)?;
        if let Some(qconfig) = spec.qconfig {
            conv.set_qconfig(Some(QConfig::from_spec(qconfig)?));
        }

        Ok(conv)
    }

    fn generate_rng(&self, seed: Option<u64>) -> StdRng {
        match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        }
    }
}

/// Builds a model following `spec`, see [`ModelBuilder::build`].
pub fn build_model(spec: &ModelSpec, seed: Option<u64>) -> Result<Sequential> {
    ModelBuilder::new().build(spec, seed)
}
