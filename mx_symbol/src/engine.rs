//! Engine trait - the external engine's C ABI as a Rust seam.
//!
//! Each method corresponds to one C function of the engine. Implementations
//! forward to the native library (`mx_engine_native`) or keep state in
//! process (`mx_engine_ref`). The bindings in this crate only ever talk to
//! an engine through this trait.

use crate::context::{Context, OpReqType};
use crate::error::Result;
use crate::handle::{ExecutorHandle, NDArrayHandle, SymbolHandle};
use crate::shape::Shape;

/// Shapes computed by the engine's shape inference.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InferredShapes {
    /// One shape per argument, in `list_arguments` order.
    pub arg_shapes: Vec<Shape>,
    /// One shape per output, in `list_outputs` order.
    pub out_shapes: Vec<Shape>,
    /// One shape per auxiliary state, in `list_auxiliary_states` order.
    pub aux_shapes: Vec<Shape>,
    /// False when the engine could not determine every shape; unknown
    /// entries are then empty.
    pub complete: bool,
}

pub trait Engine: Send + Sync {
    /// Short name for logs and diagnostics.
    fn name(&self) -> &str;

    // === Symbols ===

    /// Create a variable node.
    fn create_variable(&self, name: &str) -> Result<SymbolHandle>;

    /// Create an uncomposed operator node with string configuration.
    fn create_operator(&self, op_name: &str, config: &[(&str, &str)]) -> Result<SymbolHandle>;

    /// Attach inputs to an operator node in place. `keys` is either empty
    /// (positional) or one key per input.
    fn compose(
        &self,
        symbol: SymbolHandle,
        name: &str,
        keys: &[&str],
        inputs: &[SymbolHandle],
    ) -> Result<()>;

    /// Deep-copy a graph node.
    fn copy_symbol(&self, symbol: SymbolHandle) -> Result<SymbolHandle>;

    fn list_arguments(&self, symbol: SymbolHandle) -> Result<Vec<String>>;

    fn list_outputs(&self, symbol: SymbolHandle) -> Result<Vec<String>>;

    fn list_auxiliary_states(&self, symbol: SymbolHandle) -> Result<Vec<String>>;

    /// Infer every shape from the named argument shapes that are known.
    fn infer_shape(
        &self,
        symbol: SymbolHandle,
        known: &[(&str, &Shape)],
    ) -> Result<InferredShapes>;

    fn symbol_to_json(&self, symbol: SymbolHandle) -> Result<String>;

    fn symbol_from_json(&self, json: &str) -> Result<SymbolHandle>;

    /// Release a symbol handle. Called exactly once per handle.
    fn free_symbol(&self, symbol: SymbolHandle) -> Result<()>;

    // === Arrays ===

    fn ndarray_create(
        &self,
        shape: &Shape,
        context: Context,
        delay_alloc: bool,
    ) -> Result<NDArrayHandle>;

    fn ndarray_shape(&self, array: NDArrayHandle) -> Result<Shape>;

    fn ndarray_context(&self, array: NDArrayHandle) -> Result<Context>;

    /// Copy host data into the array; `data.len()` must equal its size.
    fn ndarray_copy_from(&self, array: NDArrayHandle, data: &[f32]) -> Result<()>;

    /// Copy the array into host memory; `out.len()` must equal its size.
    fn ndarray_copy_to(&self, array: NDArrayHandle, out: &mut [f32]) -> Result<()>;

    /// Fill the array with samples from N(mu, sigma^2).
    fn ndarray_sample_gaussian(&self, array: NDArrayHandle, mu: f32, sigma: f32) -> Result<()>;

    /// Release an array handle. Called exactly once per handle.
    fn free_ndarray(&self, array: NDArrayHandle) -> Result<()>;

    // === Executors ===

    /// Bind a graph to concrete arrays. Counts are validated by the engine.
    fn executor_bind(
        &self,
        symbol: SymbolHandle,
        context: Context,
        args: &[NDArrayHandle],
        arg_grads: &[NDArrayHandle],
        grad_reqs: &[OpReqType],
        aux_states: &[NDArrayHandle],
    ) -> Result<ExecutorHandle>;

    fn executor_forward(&self, executor: ExecutorHandle, is_train: bool) -> Result<()>;

    /// Run backward. Empty `head_grads` means unit head gradients.
    fn executor_backward(&self, executor: ExecutorHandle, head_grads: &[NDArrayHandle])
        -> Result<()>;

    /// New array handles referring to the executor's outputs. The caller
    /// owns (and must free) every returned handle.
    fn executor_outputs(&self, executor: ExecutorHandle) -> Result<Vec<NDArrayHandle>>;

    /// Release an executor handle. Called exactly once per handle.
    fn free_executor(&self, executor: ExecutorHandle) -> Result<()>;
}
