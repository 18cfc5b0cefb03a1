//! NDArray wrapper over engine array handles.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::context::Context;
use crate::engine::Engine;
use crate::error::Result;
use crate::handle::NDArrayHandle;
use crate::shape::Shape;

/// Owner of exactly one array handle; released on drop.
struct NDBlob<E: Engine + ?Sized> {
    handle: NDArrayHandle,
    engine: Arc<E>,
}

impl<E: Engine + ?Sized> Drop for NDBlob<E> {
    fn drop(&mut self) {
        debug!(engine = self.engine.name(), handle = ?self.handle, "releasing ndarray");
        if let Err(err) = self.engine.free_ndarray(self.handle) {
            warn!("failed to release ndarray handle {:?}: {err}", self.handle);
        }
    }
}

/// An engine-owned n-dimensional `f32` array.
///
/// Like [`Symbol`](crate::Symbol), clones alias the same engine array.
pub struct NDArray<E: Engine + ?Sized = dyn Engine> {
    blob: Arc<NDBlob<E>>,
}

impl<E: Engine + ?Sized> Clone for NDArray<E> {
    fn clone(&self) -> Self {
        NDArray {
            blob: Arc::clone(&self.blob),
        }
    }
}

impl<E: Engine + ?Sized> fmt::Debug for NDArray<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NDArray")
            .field("engine", &self.blob.engine.name())
            .field("handle", &self.blob.handle)
            .finish()
    }
}

impl<E: Engine + ?Sized> NDArray<E> {
    /// Wrap a handle created by `engine`, taking ownership of it.
    pub fn from_handle(engine: Arc<E>, handle: NDArrayHandle) -> Self {
        debug!(engine = engine.name(), handle = ?handle, "acquired ndarray");
        NDArray {
            blob: Arc::new(NDBlob { handle, engine }),
        }
    }

    /// Allocate an array of `shape` on `context`.
    pub fn new(engine: &Arc<E>, shape: &Shape, context: Context, delay_alloc: bool) -> Result<Self> {
        let handle = engine.ndarray_create(shape, context, delay_alloc)?;
        Ok(Self::from_handle(Arc::clone(engine), handle))
    }

    /// Allocate a zero-filled array.
    ///
    /// [`NDArray::new`] leaves the contents to the engine, which may hand
    /// back uninitialised memory.
    pub fn zeros(engine: &Arc<E>, shape: &Shape, context: Context) -> Result<Self> {
        Self::from_slice(engine, &vec![0.0; shape.numel()], shape, context)
    }

    /// Allocate an array and fill it from host data.
    pub fn from_slice(engine: &Arc<E>, data: &[f32], shape: &Shape, context: Context) -> Result<Self> {
        let array = Self::new(engine, shape, context, false)?;
        array.sync_copy_from(data)?;
        Ok(array)
    }

    pub fn handle(&self) -> NDArrayHandle {
        self.blob.handle
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.blob.engine
    }

    pub fn shape(&self) -> Result<Shape> {
        self.engine().ndarray_shape(self.handle())
    }

    pub fn context(&self) -> Result<Context> {
        self.engine().ndarray_context(self.handle())
    }

    /// Number of elements.
    pub fn size(&self) -> Result<usize> {
        Ok(self.shape()?.numel())
    }

    /// Overwrite the array with host data.
    pub fn sync_copy_from(&self, data: &[f32]) -> Result<()> {
        self.engine().ndarray_copy_from(self.handle(), data)
    }

    /// Copy the array's contents to the host.
    pub fn to_vec(&self) -> Result<Vec<f32>> {
        let mut out = vec![0.0f32; self.size()?];
        self.engine().ndarray_copy_to(self.handle(), &mut out)?;
        Ok(out)
    }

    /// Fill with samples from N(mu, sigma^2), drawn by the engine.
    pub fn sample_gaussian(&self, mu: f32, sigma: f32) -> Result<()> {
        self.engine().ndarray_sample_gaussian(self.handle(), mu, sigma)
    }
}
