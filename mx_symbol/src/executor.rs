//! Executors: a graph bound to concrete arrays.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::context::{Context, OpReqType};
use crate::engine::Engine;
use crate::error::Result;
use crate::handle::{ExecutorHandle, NDArrayHandle};
use crate::ndarray::NDArray;
use crate::symbol::{ensure_same_engine, Symbol};

/// An engine-side bound computation plan.
///
/// The executor is exclusively owned. Its handle is released when it is
/// dropped, or explicitly with [`Executor::free`]. It keeps the symbol and
/// every bound array alive for as long as the engine may read them.
pub struct Executor<E: Engine + ?Sized = dyn Engine> {
    handle: ExecutorHandle,
    released: bool,
    symbol: Symbol<E>,
    context: Context,
    arg_arrays: Vec<NDArray<E>>,
    grad_arrays: Vec<NDArray<E>>,
    grad_reqs: Vec<OpReqType>,
    aux_arrays: Vec<NDArray<E>>,
    outputs: Vec<NDArray<E>>,
}

impl<E: Engine + ?Sized> fmt::Debug for Executor<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("engine", &self.engine().name())
            .field("handle", &self.handle)
            .field("context", &self.context)
            .field("args", &self.arg_arrays.len())
            .field("aux", &self.aux_arrays.len())
            .field("outputs", &self.outputs.len())
            .finish()
    }
}

fn handles<E: Engine + ?Sized>(arrays: &[NDArray<E>]) -> Vec<NDArrayHandle> {
    arrays.iter().map(|a| a.handle()).collect()
}

impl<E: Engine + ?Sized> Executor<E> {
    /// Request an executor from the engine. Array and request counts are
    /// passed through unchecked; the engine rejects mismatches.
    pub(crate) fn bind(
        symbol: &Symbol<E>,
        context: Context,
        arg_arrays: Vec<NDArray<E>>,
        grad_arrays: Vec<NDArray<E>>,
        grad_reqs: Vec<OpReqType>,
        aux_arrays: Vec<NDArray<E>>,
    ) -> Result<Self> {
        let engine = symbol.engine();
        let handle = engine.executor_bind(
            symbol.handle(),
            context,
            &handles(&arg_arrays),
            &handles(&grad_arrays),
            &grad_reqs,
            &handles(&aux_arrays),
        )?;
        debug!(engine = engine.name(), handle = ?handle, "bound executor");

        let mut executor = Executor {
            handle,
            released: false,
            symbol: symbol.clone(),
            context,
            arg_arrays,
            grad_arrays,
            grad_reqs,
            aux_arrays,
            outputs: Vec::new(),
        };
        // Output handles alias the executor's storage, so fetching once is
        // enough to observe every later forward pass.
        executor.outputs = engine
            .executor_outputs(handle)?
            .into_iter()
            .map(|h| NDArray::from_handle(Arc::clone(engine), h))
            .collect();
        Ok(executor)
    }

    pub fn handle(&self) -> ExecutorHandle {
        self.handle
    }

    pub fn engine(&self) -> &Arc<E> {
        self.symbol.engine()
    }

    pub fn symbol(&self) -> &Symbol<E> {
        &self.symbol
    }

    pub fn context(&self) -> Context {
        self.context
    }

    /// Run the forward pass; outputs are visible through [`Executor::outputs`].
    pub fn forward(&self, is_train: bool) -> Result<()> {
        self.engine().executor_forward(self.handle, is_train)
    }

    /// Run the backward pass. With no head gradients the engine uses ones.
    pub fn backward(&self, head_grads: &[NDArray<E>]) -> Result<()> {
        for head in head_grads {
            ensure_same_engine(self.engine(), head.engine())?;
        }
        self.engine()
            .executor_backward(self.handle, &handles(head_grads))
    }

    pub fn outputs(&self) -> &[NDArray<E>] {
        &self.outputs
    }

    pub fn arg_arrays(&self) -> &[NDArray<E>] {
        &self.arg_arrays
    }

    pub fn grad_arrays(&self) -> &[NDArray<E>] {
        &self.grad_arrays
    }

    pub fn grad_reqs(&self) -> &[OpReqType] {
        &self.grad_reqs
    }

    pub fn aux_arrays(&self) -> &[NDArray<E>] {
        &self.aux_arrays
    }

    /// Argument arrays keyed by argument name.
    pub fn arg_dict(&self) -> Result<HashMap<String, NDArray<E>>> {
        Ok(zip_names(self.symbol.list_arguments()?, &self.arg_arrays))
    }

    /// Gradient arrays keyed by argument name.
    pub fn grad_dict(&self) -> Result<HashMap<String, NDArray<E>>> {
        Ok(zip_names(self.symbol.list_arguments()?, &self.grad_arrays))
    }

    /// Auxiliary state arrays keyed by state name.
    pub fn aux_dict(&self) -> Result<HashMap<String, NDArray<E>>> {
        Ok(zip_names(
            self.symbol.list_auxiliary_states()?,
            &self.aux_arrays,
        ))
    }

    /// Release the executor now, reporting the engine's error if any.
    pub fn free(mut self) -> Result<()> {
        self.released = true;
        debug!(engine = self.engine().name(), handle = ?self.handle, "freeing executor");
        self.engine().free_executor(self.handle)
    }
}

fn zip_names<E: Engine + ?Sized>(
    names: Vec<String>,
    arrays: &[NDArray<E>],
) -> HashMap<String, NDArray<E>> {
    names.into_iter().zip(arrays.iter().cloned()).collect()
}

impl<E: Engine + ?Sized> Drop for Executor<E> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        debug!(engine = self.engine().name(), handle = ?self.handle, "releasing executor");
        if let Err(err) = self.engine().free_executor(self.handle) {
            warn!("failed to release executor handle {:?}: {err}", self.handle);
        }
    }
}
