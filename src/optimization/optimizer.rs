use ndarray::{ArrayViewD, ArrayViewMutD};

pub trait Optimizer {
    fn update_params(&mut self, params: ArrayViewMutD<f32>, grad: ArrayViewD<f32>);
}
