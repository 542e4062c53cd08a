use std::sync::Arc;

use ndarray::{Array, Dimension};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// A learnable tensor that can be shared between layers.
///
/// Cloning a `Param` doesn't copy the data, both handles point to the same tensor and see each
/// other's updates. A layer stops sharing by having its handle replaced.
#[derive(Debug)]
pub struct Param<D: Dimension> {
    data: Arc<RwLock<Array<f32, D>>>,
}

impl<D: Dimension> Param<D> {
    /// Creates a new `Param` owning `data`.
    pub fn new(data: Array<f32, D>) -> Self {
        Self {
            data: Arc::new(RwLock::new(data)),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Array<f32, D>> {
        self.data.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Array<f32, D>> {
        self.data.write()
    }

    /// Returns the shape of the underlying tensor.
    pub fn shape(&self) -> Vec<usize> {
        self.data.read().shape().to_vec()
    }

    /// Returns `true` if both handles point to the same tensor.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    /// Returns a detached copy of the current values.
    pub fn to_owned_array(&self) -> Array<f32, D> {
        self.data.read().clone()
    }
}

impl<D: Dimension> Clone for Param<D> {
    fn clone(&self) -> Self {
        Self {
            data: Arc::clone(&self.data),
        }
    }
}
