//! In-process reference engine for `mx_symbol`.
//!
//! [`RefEngine`] keeps graphs, arrays and executors in handle tables behind a
//! mutex and evaluates graphs on the CPU. It implements the operator subset
//! used by `mx_nn` and the symbol arithmetic:
//!
//! | Operator         | Inputs                                        |
//! |------------------|-----------------------------------------------|
//! | `_Plus` `_Minus` `_Mul` `_Div` | `lhs`, `rhs`                    |
//! | `Activation`     | `data` (`act_type` = relu, sigmoid, tanh)     |
//! | `FullyConnected` | `data`, `weight`, `bias` (`num_hidden`, `no_bias`) |
//! | `BatchNorm`      | `data`, `gamma`, `beta`; aux `moving_mean`, `moving_var` (shapes only) |
//!
//! Every call validates its handles, so releasing a handle twice or using a
//! released handle is reported as an engine error rather than undefined
//! behaviour.

use std::collections::{BTreeMap, HashMap};
use std::os::raw::c_void;
use std::sync::{Arc, Mutex, MutexGuard};

use mx_symbol::prelude::*;
use mx_symbol::{ExecutorHandle, NDArrayHandle, SymbolHandle};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, trace};

mod exec;
mod graph;
pub mod ops;

use exec::{lock, Bound, BoundExecutor, Buffer};
use graph::{Graph, Operator};

struct ArrayEntry {
    shape: Shape,
    context: Context,
    data: Buffer,
}

struct State {
    next_handle: usize,
    symbols: HashMap<usize, Graph>,
    arrays: HashMap<usize, ArrayEntry>,
    executors: HashMap<usize, BoundExecutor>,
    name_counters: HashMap<String, usize>,
    rng: StdRng,
}

impl State {
    fn allocate(&mut self) -> usize {
        let id = self.next_handle;
        self.next_handle += 1;
        id
    }

    fn symbol(&self, call: &'static str, handle: SymbolHandle) -> Result<&Graph> {
        self.symbols
            .get(&(handle.as_raw() as usize))
            .ok_or_else(|| Error::engine(call, "invalid symbol handle"))
    }

    fn array(&self, call: &'static str, handle: NDArrayHandle) -> Result<&ArrayEntry> {
        self.arrays
            .get(&(handle.as_raw() as usize))
            .ok_or_else(|| Error::engine(call, "invalid ndarray handle"))
    }

    fn bound(&self, call: &'static str, handle: NDArrayHandle) -> Result<Bound> {
        let entry = self.array(call, handle)?;
        Ok(Bound {
            shape: entry.shape.clone(),
            data: Arc::clone(&entry.data),
        })
    }

    fn executor(&mut self, call: &'static str, handle: ExecutorHandle) -> Result<&mut BoundExecutor> {
        self.executors
            .get_mut(&(handle.as_raw() as usize))
            .ok_or_else(|| Error::engine(call, "invalid executor handle"))
    }

    fn insert_symbol(&mut self, graph: Graph) -> SymbolHandle {
        let id = self.allocate();
        self.symbols.insert(id, graph);
        SymbolHandle::from_raw(id as *mut c_void)
    }

    fn insert_array(&mut self, entry: ArrayEntry) -> NDArrayHandle {
        let id = self.allocate();
        self.arrays.insert(id, entry);
        NDArrayHandle::from_raw(id as *mut c_void)
    }

    /// `{op}{n}`, with a separate counter per lowercased operator name.
    fn auto_name(&mut self, op_name: &str) -> String {
        let hint = op_name.to_ascii_lowercase();
        let counter = self.name_counters.entry(hint.clone()).or_insert(0);
        let name = format!("{hint}{counter}");
        *counter += 1;
        name
    }
}

/// Number of handles currently alive in a [`RefEngine`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LiveHandles {
    pub symbols: usize,
    pub ndarrays: usize,
    pub executors: usize,
}

/// CPU-only engine that evaluates graphs in process.
pub struct RefEngine {
    state: Mutex<State>,
}

impl RefEngine {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Engine whose gaussian fills are reproducible.
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        RefEngine {
            state: Mutex::new(State {
                next_handle: 1,
                symbols: HashMap::new(),
                arrays: HashMap::new(),
                executors: HashMap::new(),
                name_counters: HashMap::new(),
                rng,
            }),
        }
    }

    pub fn live_handles(&self) -> LiveHandles {
        match self.state.lock() {
            Ok(state) => LiveHandles {
                symbols: state.symbols.len(),
                ndarrays: state.arrays.len(),
                executors: state.executors.len(),
            },
            Err(_) => LiveHandles::default(),
        }
    }

    fn state(&self, call: &'static str) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| Error::engine(call, "engine state lock poisoned"))
    }
}

impl Default for RefEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn check_context(call: &'static str, context: Context) -> Result<()> {
    match context.device_type {
        DeviceType::Cpu | DeviceType::CpuPinned => Ok(()),
        DeviceType::Gpu => Err(Error::engine(
            call,
            format!("reference engine cannot place data on {context}"),
        )),
    }
}

/// Standard normal sample via the Box-Muller transform.
fn standard_normal(rng: &mut StdRng) -> f32 {
    let u1: f32 = rng.gen_range(f32::EPSILON..1.0);
    let u2: f32 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f32::consts::PI * u2).cos()
}

impl Engine for RefEngine {
    fn name(&self) -> &str {
        "reference"
    }

    // === Symbols ===

    fn create_variable(&self, name: &str) -> Result<SymbolHandle> {
        let mut state = self.state("MXSymbolCreateVariable")?;
        trace!(name, "create variable");
        Ok(state.insert_symbol(Graph::variable(name)))
    }

    fn create_operator(&self, op_name: &str, config: &[(&str, &str)]) -> Result<SymbolHandle> {
        const CALL: &str = "MXSymbolCreateAtomicSymbol";
        let attrs: BTreeMap<String, String> = config
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let op = Operator::new(op_name, attrs).map_err(|e| Error::engine(CALL, e))?;
        let mut state = self.state(CALL)?;
        trace!(op_name, "create operator");
        Ok(state.insert_symbol(Graph::Atomic(op)))
    }

    fn compose(
        &self,
        symbol: SymbolHandle,
        name: &str,
        keys: &[&str],
        inputs: &[SymbolHandle],
    ) -> Result<()> {
        const CALL: &str = "MXSymbolCompose";
        let mut state = self.state(CALL)?;
        let entries = inputs
            .iter()
            .map(|&h| {
                state
                    .symbol(CALL, h)?
                    .single_output()
                    .map_err(|e| Error::engine(CALL, e))
            })
            .collect::<Result<Vec<_>>>()?;

        let unnamed_op = match state.symbol(CALL, symbol)? {
            Graph::Atomic(op) if name.is_empty() => Some(op.op_name.clone()),
            _ => None,
        };
        let name = match unnamed_op {
            Some(op_name) => state.auto_name(&op_name),
            None => name.to_string(),
        };
        debug!(%name, inputs = inputs.len(), "compose");

        let graph = state
            .symbols
            .get_mut(&(symbol.as_raw() as usize))
            .ok_or_else(|| Error::engine(CALL, "invalid symbol handle"))?;
        graph
            .compose(&name, keys, entries)
            .map_err(|e| Error::engine(CALL, e))
    }

    fn copy_symbol(&self, symbol: SymbolHandle) -> Result<SymbolHandle> {
        let mut state = self.state("MXSymbolCopy")?;
        let graph = state.symbol("MXSymbolCopy", symbol)?.clone();
        Ok(state.insert_symbol(graph))
    }

    fn list_arguments(&self, symbol: SymbolHandle) -> Result<Vec<String>> {
        let state = self.state("MXSymbolListArguments")?;
        Ok(state.symbol("MXSymbolListArguments", symbol)?.list_arguments())
    }

    fn list_outputs(&self, symbol: SymbolHandle) -> Result<Vec<String>> {
        let state = self.state("MXSymbolListOutputs")?;
        Ok(state.symbol("MXSymbolListOutputs", symbol)?.list_outputs())
    }

    fn list_auxiliary_states(&self, symbol: SymbolHandle) -> Result<Vec<String>> {
        let state = self.state("MXSymbolListAuxiliaryStates")?;
        Ok(state
            .symbol("MXSymbolListAuxiliaryStates", symbol)?
            .list_auxiliary_states())
    }

    fn infer_shape(&self, symbol: SymbolHandle, known: &[(&str, &Shape)]) -> Result<InferredShapes> {
        const CALL: &str = "MXSymbolInferShape";
        let state = self.state(CALL)?;
        state
            .symbol(CALL, symbol)?
            .infer_shape(known)
            .map_err(|e| Error::engine(CALL, e))
    }

    fn symbol_to_json(&self, symbol: SymbolHandle) -> Result<String> {
        const CALL: &str = "MXSymbolSaveToJSON";
        let state = self.state(CALL)?;
        state
            .symbol(CALL, symbol)?
            .to_json()
            .map_err(|e| Error::engine(CALL, e))
    }

    fn symbol_from_json(&self, json: &str) -> Result<SymbolHandle> {
        const CALL: &str = "MXSymbolCreateFromJSON";
        let graph = Graph::from_json(json).map_err(|e| Error::engine(CALL, e))?;
        let mut state = self.state(CALL)?;
        Ok(state.insert_symbol(graph))
    }

    fn free_symbol(&self, symbol: SymbolHandle) -> Result<()> {
        let mut state = self.state("MXSymbolFree")?;
        match state.symbols.remove(&(symbol.as_raw() as usize)) {
            Some(_) => Ok(()),
            None => Err(Error::engine("MXSymbolFree", "invalid symbol handle")),
        }
    }

    // === Arrays ===

    fn ndarray_create(&self, shape: &Shape, context: Context, _delay_alloc: bool) -> Result<NDArrayHandle> {
        const CALL: &str = "MXNDArrayCreate";
        check_context(CALL, context)?;
        if shape.is_unknown() || shape.dims().contains(&0) {
            return Err(Error::engine(CALL, format!("cannot allocate an array of shape {shape}")));
        }
        let mut state = self.state(CALL)?;
        trace!(%shape, %context, "create ndarray");
        Ok(state.insert_array(ArrayEntry {
            shape: shape.clone(),
            context,
            data: Arc::new(Mutex::new(vec![0.0; shape.numel()])),
        }))
    }

    fn ndarray_shape(&self, array: NDArrayHandle) -> Result<Shape> {
        let state = self.state("MXNDArrayGetShape")?;
        Ok(state.array("MXNDArrayGetShape", array)?.shape.clone())
    }

    fn ndarray_context(&self, array: NDArrayHandle) -> Result<Context> {
        let state = self.state("MXNDArrayGetContext")?;
        Ok(state.array("MXNDArrayGetContext", array)?.context)
    }

    fn ndarray_copy_from(&self, array: NDArrayHandle, data: &[f32]) -> Result<()> {
        const CALL: &str = "MXNDArraySyncCopyFromCPU";
        let state = self.state(CALL)?;
        let entry = state.array(CALL, array)?;
        let mut storage = lock(&entry.data).map_err(|e| Error::engine(CALL, e))?;
        if storage.len() != data.len() {
            return Err(Error::engine(
                CALL,
                format!("expected {} elements, got {}", storage.len(), data.len()),
            ));
        }
        storage.copy_from_slice(data);
        Ok(())
    }

    fn ndarray_copy_to(&self, array: NDArrayHandle, out: &mut [f32]) -> Result<()> {
        const CALL: &str = "MXNDArraySyncCopyToCPU";
        let state = self.state(CALL)?;
        let entry = state.array(CALL, array)?;
        let storage = lock(&entry.data).map_err(|e| Error::engine(CALL, e))?;
        if storage.len() != out.len() {
            return Err(Error::engine(
                CALL,
                format!("expected {} elements, got {}", storage.len(), out.len()),
            ));
        }
        out.copy_from_slice(&storage);
        Ok(())
    }

    fn ndarray_sample_gaussian(&self, array: NDArrayHandle, mu: f32, sigma: f32) -> Result<()> {
        const CALL: &str = "_random_normal";
        let mut state = self.state(CALL)?;
        let data = Arc::clone(&state.array(CALL, array)?.data);
        let mut storage = lock(&data).map_err(|e| Error::engine(CALL, e))?;
        for value in storage.iter_mut() {
            *value = mu + sigma * standard_normal(&mut state.rng);
        }
        Ok(())
    }

    fn free_ndarray(&self, array: NDArrayHandle) -> Result<()> {
        let mut state = self.state("MXNDArrayFree")?;
        match state.arrays.remove(&(array.as_raw() as usize)) {
            Some(_) => Ok(()),
            None => Err(Error::engine("MXNDArrayFree", "invalid ndarray handle")),
        }
    }

    // === Executors ===

    fn executor_bind(
        &self,
        symbol: SymbolHandle,
        context: Context,
        args: &[NDArrayHandle],
        arg_grads: &[NDArrayHandle],
        grad_reqs: &[OpReqType],
        aux_states: &[NDArrayHandle],
    ) -> Result<ExecutorHandle> {
        const CALL: &str = "MXExecutorBind";
        check_context(CALL, context)?;
        let mut state = self.state(CALL)?;

        let bound_args = args
            .iter()
            .map(|&h| state.bound(CALL, h))
            .collect::<Result<Vec<_>>>()?;
        let bound_grads = arg_grads
            .iter()
            .map(|&h| state.bound(CALL, h).map(Some))
            .collect::<Result<Vec<_>>>()?;
        let bound_aux = aux_states
            .iter()
            .map(|&h| state.bound(CALL, h))
            .collect::<Result<Vec<_>>>()?;

        let executor = BoundExecutor::bind(
            state.symbol(CALL, symbol)?,
            bound_args,
            bound_grads,
            grad_reqs.to_vec(),
            bound_aux,
        )
        .map_err(|e| Error::engine(CALL, e))?;

        let id = state.allocate();
        state.executors.insert(id, executor);
        debug!(id, args = args.len(), aux = aux_states.len(), "bind executor");
        Ok(ExecutorHandle::from_raw(id as *mut c_void))
    }

    fn executor_forward(&self, executor: ExecutorHandle, is_train: bool) -> Result<()> {
        const CALL: &str = "MXExecutorForward";
        let mut state = self.state(CALL)?;
        state
            .executor(CALL, executor)?
            .forward(is_train)
            .map_err(|e| Error::engine(CALL, e))
    }

    fn executor_backward(&self, executor: ExecutorHandle, head_grads: &[NDArrayHandle]) -> Result<()> {
        const CALL: &str = "MXExecutorBackward";
        let mut state = self.state(CALL)?;
        let heads = head_grads
            .iter()
            .map(|&h| state.bound(CALL, h))
            .collect::<Result<Vec<_>>>()?;
        state
            .executor(CALL, executor)?
            .backward(&heads)
            .map_err(|e| Error::engine(CALL, e))
    }

    fn executor_outputs(&self, executor: ExecutorHandle) -> Result<Vec<NDArrayHandle>> {
        const CALL: &str = "MXExecutorOutputs";
        let mut state = self.state(CALL)?;
        let outputs = state.executor(CALL, executor)?.outputs().to_vec();
        Ok(outputs
            .into_iter()
            .map(|out| {
                state.insert_array(ArrayEntry {
                    shape: out.shape,
                    context: Context::cpu(),
                    data: out.data,
                })
            })
            .collect())
    }

    fn free_executor(&self, executor: ExecutorHandle) -> Result<()> {
        let mut state = self.state("MXExecutorFree")?;
        match state.executors.remove(&(executor.as_raw() as usize)) {
            Some(_) => Ok(()),
            None => Err(Error::engine("MXExecutorFree", "invalid executor handle")),
        }
    }
}
