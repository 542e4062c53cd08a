use ndarray::{Array4, ArrayView4};

use super::{layers::Layer, loss::LossFn};
use crate::{optimization::Optimizer, QatErr, Result};

/// A sequential model: information flows forward when computing an output and backward when
/// computing the gradients of its layers.
#[derive(Debug, Clone, Default)]
pub struct Sequential {
    layers: Vec<Layer>,
}

impl Sequential {
    /// Creates a new `Sequential`.
    ///
    /// # Arguments
    /// * `layers` - The layers the sequential is composed of.
    ///
    /// # Returns
    /// A new `Sequential` instance.
    pub fn new<I>(layers: I) -> Self
    where
        I: IntoIterator<Item = Layer>,
    {
        Self {
            layers: layers.into_iter().collect(),
        }
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn layers_mut(&mut self) -> &mut [Layer] {
        &mut self.layers
    }

    pub fn into_layers(self) -> Vec<Layer> {
        self.layers
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Makes a forward pass through the network.
    ///
    /// # Arguments
    /// * `x` - The input data, shaped `(n, c, h, w)`.
    ///
    /// # Returns
    /// The prediction for the given input or an error if occurred.
    pub fn forward(&mut self, x: ArrayView4<f32>) -> Result<Array4<f32>> {
        let mut layers = self.layers.iter_mut();
        let Some(first) = layers.next() else {
            return Ok(x.to_owned());
        };

        let mut y = first.forward(x)?;
        for layer in layers {
            y = layer.forward(y.view())?;
        }

        Ok(y)
    }

    /// Backpropagates `d` through every layer, in reverse order.
    ///
    /// # Arguments
    /// * `d` - The gradient with respect to the network's output.
    ///
    /// # Returns
    /// The gradient with respect to the network's input.
    pub fn backward(&mut self, d: ArrayView4<f32>) -> Result<Array4<f32>> {
        let mut d = d.to_owned();
        for layer in self.layers.iter_mut().rev() {
            d = layer.backward(d.view())?;
        }

        Ok(d)
    }

    /// Applies the gradients left by the last backward pass.
    pub fn step<O: Optimizer>(&mut self, optimizer: &mut O) {
        self.layers
            .iter_mut()
            .for_each(|layer| layer.step(optimizer));
    }

    pub fn enable_observer(&mut self, enabled: bool) {
        self.layers
            .iter_mut()
            .for_each(|layer| layer.enable_observer(enabled));
    }

    pub fn enable_fake_quant(&mut self, enabled: bool) {
        self.layers
            .iter_mut()
            .for_each(|layer| layer.enable_fake_quant(enabled));
    }

    /// Runs forward, backward and an optimizer step over every batch.
    ///
    /// # Arguments
    /// * `optimizer` - Dictates how to update the parameters on each gradient calculation.
    /// * `loss_fn` - The loss function.
    /// * `batches` - The `(x, y)` pairs to train on.
    ///
    /// # Returns
    /// The loss averaged over the batches.
    pub fn backprop<'a, O, L, I>(
        &mut self,
        optimizer: &mut O,
        loss_fn: &L,
        batches: I,
    ) -> Result<f32>
    where
        O: Optimizer,
        L: LossFn,
        I: IntoIterator<Item = (ArrayView4<'a, f32>, ArrayView4<'a, f32>)>,
    {
        let mut total_loss = 0.0;
        let mut num_batches = 0;

        for (x, y) in batches {
            let y_pred = self.forward(x)?;
            if y_pred.shape() != y.shape() {
                return Err(QatErr::ShapeMismatch {
                    what: "prediction and target",
                    got: y_pred.shape().to_vec(),
                    expected: y.shape().to_vec(),
                });
            }

            total_loss += loss_fn.loss(y_pred.view(), y);
            num_batches += 1;

            let d = loss_fn.loss_prime(y_pred.view(), y);
            self.backward(d.view())?;
            self.step(optimizer);
        }

        Ok(total_loss / num_batches.max(1) as f32)
    }
}
