//! Python bindings for the symbolic-graph library.
//!
//! Provides `Engine`, `Symbol`, `NDArray` and `Executor` classes over any
//! engine implementation, plus layer constructors and an SGD updater.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use pyo3::create_exception;
use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::{PyBool, PyDict};

use mx_engine_native::NativeEngine;
use mx_engine_ref::RefEngine;
use mx_nn::{ActType, BatchNormParams, Sgd};
use mx_symbol::{Context, Engine, Executor, NDArray, OpReqType, Shape, Symbol};

create_exception!(
    mx_py,
    MXNetError,
    PyRuntimeError,
    "Raised when the engine rejects a call."
);

fn mx_err(err: mx_symbol::Error) -> PyErr {
    MXNetError::new_err(err.to_string())
}

fn value_err(err: impl std::fmt::Display) -> PyErr {
    PyValueError::new_err(err.to_string())
}

fn parse_context(ctx: &str) -> PyResult<Context> {
    ctx.parse().map_err(value_err)
}

/// Operator parameters are passed to the engine as strings; Python booleans
/// become `true`/`false`.
fn param_string(value: &Bound<'_, PyAny>) -> PyResult<String> {
    if let Ok(flag) = value.downcast::<PyBool>() {
        return Ok(if flag.is_true() { "true" } else { "false" }.to_string());
    }
    Ok(value.str()?.to_string())
}

/// A tensor engine: either the in-process reference engine or the native
/// library loaded at run time.
///
/// Example:
///     >>> engine = Engine.reference(seed=0)
///     >>> engine.name
///     'reference'
#[pyclass(name = "Engine")]
#[derive(Clone)]
struct PyEngine {
    inner: Arc<dyn Engine>,
}

#[pymethods]
impl PyEngine {
    /// In-process reference engine. `seed` fixes the random initialisation.
    #[staticmethod]
    #[pyo3(signature = (seed = None))]
    fn reference(seed: Option<u64>) -> Self {
        let engine = match seed {
            Some(seed) => RefEngine::with_seed(seed),
            None => RefEngine::new(),
        };
        PyEngine {
            inner: Arc::new(engine),
        }
    }

    /// Load the native engine from `path`, or from `MXNET_LIBRARY_PATH`
    /// when no path is given.
    #[staticmethod]
    #[pyo3(signature = (path = None))]
    fn native(path: Option<PathBuf>) -> PyResult<Self> {
        let engine = match path {
            Some(path) => NativeEngine::load(path),
            None => NativeEngine::from_env(),
        }
        .map_err(mx_err)?;
        Ok(PyEngine {
            inner: Arc::new(engine),
        })
    }

    #[getter]
    fn name(&self) -> String {
        self.inner.name().to_string()
    }

    /// Create a variable symbol.
    fn variable(&self, name: &str) -> PyResult<PySymbol> {
        Symbol::variable(&self.inner, name)
            .map(PySymbol::new)
            .map_err(mx_err)
    }

    /// Create an operator node.
    ///
    /// Args:
    ///     op_name: Registered operator name, e.g. "FullyConnected"
    ///     name: Node name; empty lets the engine choose one
    ///     inputs: Dict of input key to Symbol
    ///     **params: Operator parameters
    ///
    /// Example:
    ///     >>> fc = engine.operator("FullyConnected", "fc1",
    ///     ...                      {"data": data}, num_hidden=4)
    ///     >>> fc.list_arguments()
    ///     ['data', 'fc1_weight', 'fc1_bias']
    #[pyo3(signature = (op_name, name = "", inputs = None, **params))]
    fn operator(
        &self,
        op_name: &str,
        name: &str,
        inputs: Option<&Bound<'_, PyDict>>,
        params: Option<&Bound<'_, PyDict>>,
    ) -> PyResult<PySymbol> {
        let mut keyed: Vec<(String, PySymbol)> = Vec::new();
        if let Some(inputs) = inputs {
            for (key, value) in inputs.iter() {
                keyed.push((key.extract()?, value.extract()?));
            }
        }
        let mut config: Vec<(String, String)> = Vec::new();
        if let Some(params) = params {
            for (key, value) in params.iter() {
                config.push((key.extract()?, param_string(&value)?));
            }
        }

        let inputs: Vec<(&str, &Symbol)> = keyed.iter().map(|(k, s)| (k.as_str(), &s.inner)).collect();
        let config: Vec<(&str, &str)> = config.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        Symbol::operator(&self.inner, op_name, name, &inputs, &config)
            .map(PySymbol::new)
            .map_err(mx_err)
    }

    /// Load a symbol from its JSON form.
    fn load_json(&self, json: &str) -> PyResult<PySymbol> {
        Symbol::from_json(&self.inner, json)
            .map(PySymbol::new)
            .map_err(mx_err)
    }

    /// Create an array holding `data` with the given shape.
    #[pyo3(signature = (data, shape, ctx = "cpu"))]
    fn array(&self, data: Vec<f32>, shape: Vec<u32>, ctx: &str) -> PyResult<PyNDArray> {
        NDArray::from_slice(&self.inner, &data, &Shape::new(shape), parse_context(ctx)?)
            .map(PyNDArray::new)
            .map_err(mx_err)
    }

    /// Create a zero-filled array.
    #[pyo3(signature = (shape, ctx = "cpu"))]
    fn zeros(&self, shape: Vec<u32>, ctx: &str) -> PyResult<PyNDArray> {
        NDArray::zeros(&self.inner, &Shape::new(shape), parse_context(ctx)?)
            .map(PyNDArray::new)
            .map_err(mx_err)
    }

    fn __repr__(&self) -> String {
        format!("Engine('{}')", self.inner.name())
    }
}

/// A node of a symbolic graph.
///
/// Symbols can be combined with +, -, * and /; each operator adds a new
/// engine node over both operands.
///
/// Example:
///     >>> x = engine.variable("x")
///     >>> y = engine.variable("y")
///     >>> z = x * y + x
///     >>> z.list_arguments()
///     ['x', 'y']
#[pyclass(name = "Symbol")]
#[derive(Clone)]
struct PySymbol {
    inner: Symbol,
}

impl PySymbol {
    fn new(inner: Symbol) -> Self {
        PySymbol { inner }
    }

    fn grad_reqs(&self, grad_req: Option<&Bound<'_, PyAny>>) -> PyResult<HashMap<String, OpReqType>> {
        let Some(grad_req) = grad_req else {
            return Ok(HashMap::new());
        };
        if let Ok(req) = grad_req.extract::<String>() {
            let req: OpReqType = req.parse().map_err(value_err)?;
            let names = self.inner.list_arguments().map_err(mx_err)?;
            return Ok(names.into_iter().map(|name| (name, req)).collect());
        }
        let by_name: HashMap<String, String> = grad_req.extract()?;
        by_name
            .into_iter()
            .map(|(name, req)| {
                req.parse::<OpReqType>()
                    .map(|req| (name, req))
                    .map_err(value_err)
            })
            .collect()
    }
}

type ShapeLists = (Vec<Vec<u32>>, Vec<Vec<u32>>, Vec<Vec<u32>>);

fn dims(shapes: &[Shape]) -> Vec<Vec<u32>> {
    shapes.iter().map(|s| s.dims().to_vec()).collect()
}

#[pymethods]
impl PySymbol {
    fn list_arguments(&self) -> PyResult<Vec<String>> {
        self.inner.list_arguments().map_err(mx_err)
    }

    fn list_outputs(&self) -> PyResult<Vec<String>> {
        self.inner.list_outputs().map_err(mx_err)
    }

    fn list_auxiliary_states(&self) -> PyResult<Vec<String>> {
        self.inner.list_auxiliary_states().map_err(mx_err)
    }

    /// Infer argument, output and auxiliary shapes from known argument shapes.
    ///
    /// Returns (arg_shapes, out_shapes, aux_shapes), or None when the known
    /// shapes are not enough to determine all of them.
    ///
    /// Example:
    ///     >>> arg, out, aux = fc.infer_shape(data=(2, 3))
    ///     >>> out
    ///     [[2, 4]]
    #[pyo3(signature = (**shapes))]
    fn infer_shape(&self, shapes: Option<&Bound<'_, PyDict>>) -> PyResult<Option<ShapeLists>> {
        let known: HashMap<String, Vec<u32>> = match shapes {
            Some(shapes) => shapes.extract()?,
            None => HashMap::new(),
        };
        let known: HashMap<String, Shape> = known
            .into_iter()
            .map(|(name, dims)| (name, Shape::new(dims)))
            .collect();
        let inferred = self.inner.infer_shape(&known).map_err(mx_err)?;
        if !inferred.complete {
            return Ok(None);
        }
        Ok(Some((
            dims(&inferred.arg_shapes),
            dims(&inferred.out_shapes),
            dims(&inferred.aux_shapes),
        )))
    }

    /// Serialize the graph to the engine's JSON form.
    fn tojson(&self) -> PyResult<String> {
        self.inner.to_json().map_err(mx_err)
    }

    /// Deep copy of the graph; the copy shares no nodes with this symbol.
    fn copy(&self) -> PyResult<PySymbol> {
        self.inner.copy().map(PySymbol::new).map_err(mx_err)
    }

    fn __copy__(&self) -> PyResult<PySymbol> {
        self.copy()
    }

    /// Bind with inferred arrays for anything not given.
    ///
    /// Args:
    ///     ctx: Device context, e.g. "cpu" or "gpu(0)"
    ///     args: Dict of argument name to NDArray
    ///     args_grad: Dict of argument name to gradient NDArray
    ///     grad_req: "write", "add" or "null" for every argument, or a dict
    ///         of argument name to request
    ///
    /// Missing arguments and auxiliary states are drawn from N(0, 1).
    #[pyo3(signature = (ctx = "cpu", args = None, args_grad = None, grad_req = None))]
    fn simple_bind(
        &self,
        ctx: &str,
        args: Option<HashMap<String, PyNDArray>>,
        args_grad: Option<HashMap<String, PyNDArray>>,
        grad_req: Option<&Bound<'_, PyAny>>,
    ) -> PyResult<PyExecutor> {
        let into_inner = |arrays: Option<HashMap<String, PyNDArray>>| -> HashMap<String, NDArray> {
            arrays
                .unwrap_or_default()
                .into_iter()
                .map(|(name, array)| (name, array.inner))
                .collect()
        };
        let reqs = self.grad_reqs(grad_req)?;
        self.inner
            .simple_bind(parse_context(ctx)?, &into_inner(args), &into_inner(args_grad), &reqs)
            .map(PyExecutor::new)
            .map_err(mx_err)
    }

    /// Bind to exactly the given arrays, in argument order.
    #[pyo3(signature = (ctx, args, args_grad, grad_req, aux_states = None))]
    fn bind(
        &self,
        ctx: &str,
        args: Vec<PyNDArray>,
        args_grad: Vec<PyNDArray>,
        grad_req: Vec<String>,
        aux_states: Option<Vec<PyNDArray>>,
    ) -> PyResult<PyExecutor> {
        let reqs = grad_req
            .iter()
            .map(|r| r.parse::<OpReqType>().map_err(value_err))
            .collect::<PyResult<Vec<_>>>()?;
        let arrays = |list: Vec<PyNDArray>| list.into_iter().map(|a| a.inner).collect::<Vec<_>>();
        self.inner
            .bind(
                parse_context(ctx)?,
                &arrays(args),
                &arrays(args_grad),
                &reqs,
                &arrays(aux_states.unwrap_or_default()),
            )
            .map(PyExecutor::new)
            .map_err(mx_err)
    }

    // === Operator overloads ===

    fn __add__(&self, other: &PySymbol) -> PyResult<PySymbol> {
        (&self.inner + &other.inner).map(PySymbol::new).map_err(mx_err)
    }

    fn __sub__(&self, other: &PySymbol) -> PyResult<PySymbol> {
        (&self.inner - &other.inner).map(PySymbol::new).map_err(mx_err)
    }

    fn __mul__(&self, other: &PySymbol) -> PyResult<PySymbol> {
        (&self.inner * &other.inner).map(PySymbol::new).map_err(mx_err)
    }

    fn __truediv__(&self, other: &PySymbol) -> PyResult<PySymbol> {
        (&self.inner / &other.inner).map(PySymbol::new).map_err(mx_err)
    }

    fn __repr__(&self) -> String {
        match self.inner.list_outputs() {
            Ok(outputs) => format!("Symbol(outputs={outputs:?})"),
            Err(_) => "Symbol(<invalid>)".to_string(),
        }
    }
}

/// An engine-owned array of float32 values.
#[pyclass(name = "NDArray")]
#[derive(Clone)]
struct PyNDArray {
    inner: NDArray,
}

impl PyNDArray {
    fn new(inner: NDArray) -> Self {
        PyNDArray { inner }
    }
}

#[pymethods]
impl PyNDArray {
    #[getter]
    fn shape(&self) -> PyResult<Vec<u32>> {
        self.inner.shape().map(|s| s.dims().to_vec()).map_err(mx_err)
    }

    #[getter]
    fn context(&self) -> PyResult<String> {
        self.inner.context().map(|c| c.to_string()).map_err(mx_err)
    }

    #[getter]
    fn size(&self) -> PyResult<usize> {
        self.inner.size().map_err(mx_err)
    }

    /// Copy the array's contents out as a flat list.
    fn tolist(&self) -> PyResult<Vec<f32>> {
        self.inner.to_vec().map_err(mx_err)
    }

    /// Overwrite the array with `data`, which must hold exactly `size` values.
    fn copy_from(&self, data: Vec<f32>) -> PyResult<()> {
        self.inner.sync_copy_from(&data).map_err(mx_err)
    }

    /// Fill the array with samples from N(mu, sigma^2).
    #[pyo3(signature = (mu = 0.0, sigma = 1.0))]
    fn sample_gaussian(&self, mu: f32, sigma: f32) -> PyResult<()> {
        self.inner.sample_gaussian(mu, sigma).map_err(mx_err)
    }

    fn __len__(&self) -> PyResult<usize> {
        self.size()
    }

    fn __repr__(&self) -> String {
        match (self.inner.shape(), self.inner.context()) {
            (Ok(shape), Ok(ctx)) => format!("NDArray(shape={shape}, ctx={ctx})"),
            _ => "NDArray(<invalid>)".to_string(),
        }
    }
}

/// A bound graph ready for forward and backward passes.
///
/// The engine resources are released when the executor is garbage
/// collected, or earlier with `free()`.
#[pyclass(name = "Executor")]
struct PyExecutor {
    inner: Option<Executor>,
}

impl PyExecutor {
    fn new(inner: Executor) -> Self {
        PyExecutor { inner: Some(inner) }
    }

    fn get(&self) -> PyResult<&Executor> {
        self.inner
            .as_ref()
            .ok_or_else(|| MXNetError::new_err("executor has been freed"))
    }
}

fn wrap_dict(arrays: HashMap<String, NDArray>) -> HashMap<String, PyNDArray> {
    arrays
        .into_iter()
        .map(|(name, array)| (name, PyNDArray::new(array)))
        .collect()
}

#[pymethods]
impl PyExecutor {
    /// Run the graph forward; results land in `outputs`.
    #[pyo3(signature = (is_train = false))]
    fn forward(&self, is_train: bool) -> PyResult<()> {
        self.get()?.forward(is_train).map_err(mx_err)
    }

    /// Propagate gradients back to the arguments.
    ///
    /// `head_grads` holds one array per output; when omitted every output
    /// gets a gradient of ones.
    #[pyo3(signature = (head_grads = None))]
    fn backward(&self, head_grads: Option<Vec<PyNDArray>>) -> PyResult<()> {
        let heads: Vec<NDArray> = head_grads
            .unwrap_or_default()
            .into_iter()
            .map(|a| a.inner)
            .collect();
        self.get()?.backward(&heads).map_err(mx_err)
    }

    /// Output arrays. They alias the executor's storage, so they reflect
    /// every later forward pass.
    #[getter]
    fn outputs(&self) -> PyResult<Vec<PyNDArray>> {
        Ok(self
            .get()?
            .outputs()
            .iter()
            .cloned()
            .map(PyNDArray::new)
            .collect())
    }

    #[getter]
    fn arg_dict(&self) -> PyResult<HashMap<String, PyNDArray>> {
        self.get()?.arg_dict().map(wrap_dict).map_err(mx_err)
    }

    #[getter]
    fn grad_dict(&self) -> PyResult<HashMap<String, PyNDArray>> {
        self.get()?.grad_dict().map(wrap_dict).map_err(mx_err)
    }

    #[getter]
    fn aux_dict(&self) -> PyResult<HashMap<String, PyNDArray>> {
        self.get()?.aux_dict().map(wrap_dict).map_err(mx_err)
    }

    /// Release the engine executor now. Later calls raise MXNetError.
    fn free(&mut self) -> PyResult<()> {
        match self.inner.take() {
            Some(exec) => exec.free().map_err(mx_err),
            None => Ok(()),
        }
    }

    fn __repr__(&self) -> String {
        match &self.inner {
            Some(exec) => format!("Executor(ctx={})", exec.context()),
            None => "Executor(<freed>)".to_string(),
        }
    }
}

/// Stochastic gradient descent over an executor's arguments.
///
/// Example:
///     >>> opt = SGD(0.1, momentum=0.9)
///     >>> exec.forward(is_train=True)
///     >>> exec.backward()
///     >>> opt.update(exec)
#[pyclass(name = "SGD")]
struct PySgd {
    inner: Sgd,
}

#[pymethods]
impl PySgd {
    #[new]
    #[pyo3(signature = (learning_rate, momentum = 0.0, weight_decay = 0.0))]
    fn new(learning_rate: f32, momentum: f32, weight_decay: f32) -> Self {
        PySgd {
            inner: Sgd::with_momentum(learning_rate, momentum).weight_decay(weight_decay),
        }
    }

    /// Update every argument that has a gradient request.
    fn update(&mut self, executor: &PyExecutor) -> PyResult<()> {
        self.inner.update(executor.get()?).map_err(mx_err)
    }

    /// Forget accumulated momentum.
    fn reset(&mut self) {
        self.inner.reset();
    }
}

/// Fully connected layer over `data`.
///
/// Adds the arguments `{name}_weight` and, unless `no_bias`, `{name}_bias`.
#[pyfunction]
#[pyo3(signature = (data, num_hidden, name = "", no_bias = false))]
fn fully_connected(data: &PySymbol, num_hidden: u32, name: &str, no_bias: bool) -> PyResult<PySymbol> {
    mx_nn::fully_connected(&data.inner, name, num_hidden, no_bias)
        .map(PySymbol::new)
        .map_err(mx_err)
}

/// Elementwise activation: "relu", "sigmoid" or "tanh".
#[pyfunction]
#[pyo3(signature = (data, act_type, name = ""))]
fn activation(data: &PySymbol, act_type: &str, name: &str) -> PyResult<PySymbol> {
    let act: ActType = act_type.parse().map_err(value_err)?;
    mx_nn::activation(&data.inner, name, act)
        .map(PySymbol::new)
        .map_err(mx_err)
}

/// Batch normalization over axis 1 of `data`.
#[pyfunction]
#[pyo3(signature = (data, name = "", eps = 1e-3, momentum = 0.9, fix_gamma = true))]
fn batch_norm(data: &PySymbol, name: &str, eps: f32, momentum: f32, fix_gamma: bool) -> PyResult<PySymbol> {
    let params = BatchNormParams {
        eps,
        momentum,
        fix_gamma,
    };
    mx_nn::batch_norm(&data.inner, name, params)
        .map(PySymbol::new)
        .map_err(mx_err)
}

/// Stack of fully connected layers with `act_type` between them.
///
/// Example:
///     >>> net = mlp(data, [8, 1], act_type="tanh")
///     >>> net.list_arguments()
///     ['data', 'fc1_weight', 'fc1_bias', 'fc2_weight', 'fc2_bias']
#[pyfunction]
#[pyo3(signature = (data, hidden, act_type = "relu", prefix = ""))]
fn mlp(data: &PySymbol, hidden: Vec<u32>, act_type: &str, prefix: &str) -> PyResult<PySymbol> {
    let act: ActType = act_type.parse().map_err(value_err)?;
    mx_nn::mlp(&data.inner, prefix, &hidden, act)
        .map(PySymbol::new)
        .map_err(mx_err)
}

/// Python module for building and executing symbolic graphs.
#[pymodule]
fn mx_py(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add("MXNetError", m.py().get_type::<MXNetError>())?;
    m.add_class::<PyEngine>()?;
    m.add_class::<PySymbol>()?;
    m.add_class::<PyNDArray>()?;
    m.add_class::<PyExecutor>()?;
    m.add_class::<PySgd>()?;
    m.add_function(wrap_pyfunction!(fully_connected, m)?)?;
    m.add_function(wrap_pyfunction!(activation, m)?)?;
    m.add_function(wrap_pyfunction!(batch_norm, m)?)?;
    m.add_function(wrap_pyfunction!(mlp, m)?)?;
    Ok(())
}
