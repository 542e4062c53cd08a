use ndarray::{Array4, ArrayView4};

pub trait LossFn {
    fn loss(&self, y_pred: ArrayView4<f32>, y: ArrayView4<f32>) -> f32;
    fn loss_prime(&self, y_pred: ArrayView4<f32>, y: ArrayView4<f32>) -> Array4<f32>;
}
