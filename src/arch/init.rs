use ndarray::{Array1, Array4};
use rand::Rng;
use rand_distr::{Distribution, Uniform};

use super::layers::Conv2dOptions;
use crate::{QatErr, Result};

/// Draws the initial weight and bias of a convolution from `U(-1/sqrt(fan_in), 1/sqrt(fan_in))`.
///
/// # Arguments
/// * `options` - The geometry of the layer.
/// * `rng` - A random number generator.
///
/// # Returns
/// The weight and, if the layer has one, the bias.
pub fn conv_params<R: Rng + ?Sized>(
    options: &Conv2dOptions,
    rng: &mut R,
) -> Result<(Array4<f32>, Option<Array1<f32>>)> {
    let bound = 1.0 / (options.fan_in() as f32).sqrt();
    let dist = Uniform::new(-bound, bound).map_err(|e| QatErr::InvalidGeometry(e.to_string()))?;

    let weight = Array4::from_shape_simple_fn(options.weight_shape(), || dist.sample(rng));
    let bias = options
        .bias
        .then(|| Array1::from_shape_simple_fn(options.out_channels, || dist.sample(rng)));

    Ok((weight, bias))
}
