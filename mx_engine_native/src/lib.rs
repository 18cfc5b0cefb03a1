//! Adapter from the `mx_symbol` [`Engine`] trait to the native engine
//! library, loaded at run time.
//!
//! The library is located by, in order: an explicit path passed to
//! [`NativeEngine::load`], the `MXNET_LIBRARY_PATH` environment variable,
//! and the platform's default library name on the loader's search path.
//!
//! Every failing call is turned into [`Error::Engine`] carrying the C
//! function's name and the engine's last-error text.

use std::collections::HashMap;
use std::os::raw::c_int;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::OnceLock;

use libloading::Library;
use mx_symbol::prelude::*;
use mx_symbol::{ExecutorHandle, NDArrayHandle, SymbolHandle};
use tracing::{debug, trace};

mod ffi;
mod marshal;

use ffi::{Api, AtomicSymbolCreator, MxUint, RawHandle};
use marshal::{count, flatten_shapes, read_shapes, read_str, read_strings, CStrings};

/// Environment variable naming the engine library to load.
pub const LIBRARY_PATH_ENV: &str = "MXNET_LIBRARY_PATH";

/// File name of the engine library on this platform.
pub fn default_library_name() -> &'static str {
    if cfg!(target_os = "windows") {
        "libmxnet.dll"
    } else if cfg!(target_os = "macos") {
        "libmxnet.dylib"
    } else {
        "libmxnet.so"
    }
}

/// `MXNET_LIBRARY_PATH` if set and non-empty, otherwise the default name.
///
/// The variable is read on first use only.
pub fn library_path_from_env() -> &'static Path {
    static PATH: OnceLock<PathBuf> = OnceLock::new();
    PATH.get_or_init(|| match std::env::var_os(LIBRARY_PATH_ENV) {
        Some(path) if !path.is_empty() => PathBuf::from(path),
        _ => PathBuf::from(default_library_name()),
    })
}

/// Operator creators by name. Stored as addresses so the table is `Sync`.
type Creators = std::result::Result<HashMap<String, usize>, String>;

/// The native engine, reached through its C ABI.
pub struct NativeEngine {
    api: Api,
    path: PathBuf,
    creators: OnceLock<Creators>,
    // Dropped last: the entry points above point into it.
    _lib: Library,
}

impl NativeEngine {
    /// Load the engine library at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let (lib, api) = ffi::load(&path)?;
        debug!(path = %path.display(), "loaded engine library");
        Ok(NativeEngine {
            api,
            path,
            creators: OnceLock::new(),
            _lib: lib,
        })
    }

    /// Load the library named by `MXNET_LIBRARY_PATH`, or the default name.
    pub fn from_env() -> Result<Self> {
        Self::load(library_path_from_env())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn last_error(&self) -> String {
        // SAFETY: MXGetLastError returns a thread-local string valid until the
        // next engine call on this thread; it is copied immediately.
        let ptr = unsafe { (self.api.get_last_error)() };
        if ptr.is_null() {
            return "unknown error".to_string();
        }
        unsafe { std::ffi::CStr::from_ptr(ptr) }
            .to_string_lossy()
            .into_owned()
    }

    fn check(&self, call: &'static str, rc: c_int) -> Result<()> {
        if rc == 0 {
            Ok(())
        } else {
            Err(Error::engine(call, self.last_error()))
        }
    }

    fn load_creators(&self) -> Creators {
        const LIST: &str = "MXSymbolListAtomicSymbolCreators";
        const NAME: &str = "MXSymbolGetAtomicSymbolName";
        let mut size: MxUint = 0;
        let mut array: *mut AtomicSymbolCreator = ptr::null_mut();
        // SAFETY: out-parameters are valid; the engine owns the returned array.
        let rc = unsafe { (self.api.symbol_list_atomic_symbol_creators)(&mut size, &mut array) };
        self.check(LIST, rc).map_err(|e| e.to_string())?;

        let mut creators = HashMap::with_capacity(size as usize);
        for i in 0..size as usize {
            // SAFETY: `array` holds `size` creators.
            let creator = unsafe { *array.add(i) };
            let mut name = ptr::null();
            let rc = unsafe { (self.api.symbol_get_atomic_symbol_name)(creator, &mut name) };
            self.check(NAME, rc).map_err(|e| e.to_string())?;
            let name = unsafe { read_str(NAME, name) }.map_err(|e| e.to_string())?;
            creators.insert(name, creator as usize);
        }
        debug!(count = creators.len(), "registered operator creators");
        Ok(creators)
    }

    fn creator(&self, call: &'static str, op_name: &str) -> Result<AtomicSymbolCreator> {
        match self.creators.get_or_init(|| self.load_creators()) {
            Ok(creators) => creators
                .get(op_name)
                .map(|&addr| addr as AtomicSymbolCreator)
                .ok_or_else(|| Error::engine(call, format!("operator '{op_name}' is not registered"))),
            Err(message) => Err(Error::engine(call, message.clone())),
        }
    }

    fn list_strings(
        &self,
        call: &'static str,
        f: unsafe extern "C" fn(RawHandle, *mut MxUint, *mut *const *const std::os::raw::c_char) -> c_int,
        symbol: SymbolHandle,
    ) -> Result<Vec<String>> {
        let mut size: MxUint = 0;
        let mut array = ptr::null();
        // SAFETY: out-parameters are valid; strings are copied before the next call.
        let rc = unsafe { f(symbol.as_raw(), &mut size, &mut array) };
        self.check(call, rc)?;
        unsafe { read_strings(call, size, array) }
    }

    fn new_symbol(&self, call: &'static str, rc: c_int, out: RawHandle) -> Result<SymbolHandle> {
        self.check(call, rc)?;
        Ok(SymbolHandle::from_raw(out))
    }
}

fn raw_handles<H: Copy>(handles: &[H], as_raw: impl Fn(H) -> RawHandle) -> Vec<RawHandle> {
    handles.iter().map(|&h| as_raw(h)).collect()
}

fn ptr_or_null(handles: &mut [RawHandle]) -> *mut RawHandle {
    if handles.is_empty() {
        ptr::null_mut()
    } else {
        handles.as_mut_ptr()
    }
}

impl Engine for NativeEngine {
    fn name(&self) -> &str {
        "native"
    }

    // === Symbols ===

    fn create_variable(&self, name: &str) -> Result<SymbolHandle> {
        let name = std::ffi::CString::new(name)?;
        let mut out = ptr::null_mut();
        let rc = unsafe { (self.api.symbol_create_variable)(name.as_ptr(), &mut out) };
        self.new_symbol("MXSymbolCreateVariable", rc, out)
    }

    fn create_operator(&self, op_name: &str, config: &[(&str, &str)]) -> Result<SymbolHandle> {
        const CALL: &str = "MXSymbolCreateAtomicSymbol";
        let creator = self.creator(CALL, op_name)?;
        let keys = CStrings::new(config.iter().map(|(k, _)| k))?;
        let vals = CStrings::new(config.iter().map(|(_, v)| v))?;
        let mut out = ptr::null_mut();
        trace!(op_name, params = config.len(), "create operator");
        let rc = unsafe {
            (self.api.symbol_create_atomic_symbol)(
                creator,
                count(CALL, keys.len())?,
                keys.as_ptr(),
                vals.as_ptr(),
                &mut out,
            )
        };
        self.new_symbol(CALL, rc, out)
    }

    fn compose(
        &self,
        symbol: SymbolHandle,
        name: &str,
        keys: &[&str],
        inputs: &[SymbolHandle],
    ) -> Result<()> {
        const CALL: &str = "MXSymbolCompose";
        let name = std::ffi::CString::new(name)?;
        // A null key array means positional inputs.
        let keys = CStrings::new(keys)?;
        let args = raw_handles(inputs, SymbolHandle::as_raw);
        let rc = unsafe {
            (self.api.symbol_compose)(
                symbol.as_raw(),
                name.as_ptr(),
                count(CALL, args.len())?,
                keys.as_ptr(),
                if args.is_empty() { ptr::null() } else { args.as_ptr() },
            )
        };
        self.check(CALL, rc)
    }

    fn copy_symbol(&self, symbol: SymbolHandle) -> Result<SymbolHandle> {
        let mut out = ptr::null_mut();
        let rc = unsafe { (self.api.symbol_copy)(symbol.as_raw(), &mut out) };
        self.new_symbol("MXSymbolCopy", rc, out)
    }

    fn list_arguments(&self, symbol: SymbolHandle) -> Result<Vec<String>> {
        self.list_strings("MXSymbolListArguments", self.api.symbol_list_arguments, symbol)
    }

    fn list_outputs(&self, symbol: SymbolHandle) -> Result<Vec<String>> {
        self.list_strings("MXSymbolListOutputs", self.api.symbol_list_outputs, symbol)
    }

    fn list_auxiliary_states(&self, symbol: SymbolHandle) -> Result<Vec<String>> {
        self.list_strings(
            "MXSymbolListAuxiliaryStates",
            self.api.symbol_list_auxiliary_states,
            symbol,
        )
    }

    fn infer_shape(&self, symbol: SymbolHandle, known: &[(&str, &Shape)]) -> Result<InferredShapes> {
        const CALL: &str = "MXSymbolInferShape";
        let keys = CStrings::new(known.iter().map(|(k, _)| k))?;
        let shapes: Vec<&Shape> = known.iter().map(|(_, s)| *s).collect();
        let (ind_ptr, data) = flatten_shapes(&shapes);

        let (mut in_size, mut in_ndim, mut in_data) = (0, ptr::null(), ptr::null());
        let (mut out_size, mut out_ndim, mut out_data) = (0, ptr::null(), ptr::null());
        let (mut aux_size, mut aux_ndim, mut aux_data) = (0, ptr::null(), ptr::null());
        let mut complete: c_int = 0;
        // SAFETY: the input arrays live across the call; outputs are engine
        // owned and copied before the next call.
        let rc = unsafe {
            (self.api.symbol_infer_shape)(
                symbol.as_raw(),
                count(CALL, keys.len())?,
                keys.as_ptr(),
                ind_ptr.as_ptr(),
                data.as_ptr(),
                &mut in_size,
                &mut in_ndim,
                &mut in_data,
                &mut out_size,
                &mut out_ndim,
                &mut out_data,
                &mut aux_size,
                &mut aux_ndim,
                &mut aux_data,
                &mut complete,
            )
        };
        self.check(CALL, rc)?;
        unsafe {
            Ok(InferredShapes {
                arg_shapes: read_shapes(in_size, in_ndim, in_data),
                out_shapes: read_shapes(out_size, out_ndim, out_data),
                aux_shapes: read_shapes(aux_size, aux_ndim, aux_data),
                complete: complete != 0,
            })
        }
    }

    fn symbol_to_json(&self, symbol: SymbolHandle) -> Result<String> {
        const CALL: &str = "MXSymbolSaveToJSON";
        let mut json = ptr::null();
        let rc = unsafe { (self.api.symbol_save_to_json)(symbol.as_raw(), &mut json) };
        self.check(CALL, rc)?;
        unsafe { read_str(CALL, json) }
    }

    fn symbol_from_json(&self, json: &str) -> Result<SymbolHandle> {
        let json = std::ffi::CString::new(json)?;
        let mut out = ptr::null_mut();
        let rc = unsafe { (self.api.symbol_create_from_json)(json.as_ptr(), &mut out) };
        self.new_symbol("MXSymbolCreateFromJSON", rc, out)
    }

    fn free_symbol(&self, symbol: SymbolHandle) -> Result<()> {
        let rc = unsafe { (self.api.symbol_free)(symbol.as_raw()) };
        self.check("MXSymbolFree", rc)
    }

    // === Arrays ===

    fn ndarray_create(&self, shape: &Shape, context: Context, delay_alloc: bool) -> Result<NDArrayHandle> {
        const CALL: &str = "MXNDArrayCreate";
        let mut out = ptr::null_mut();
        let rc = unsafe {
            (self.api.ndarray_create)(
                shape.dims().as_ptr(),
                count(CALL, shape.ndim())?,
                context.device_type.code(),
                context.device_id,
                c_int::from(delay_alloc),
                &mut out,
            )
        };
        self.check(CALL, rc)?;
        Ok(NDArrayHandle::from_raw(out))
    }

    fn ndarray_shape(&self, array: NDArrayHandle) -> Result<Shape> {
        let mut ndim: MxUint = 0;
        let mut data = ptr::null();
        let rc = unsafe { (self.api.ndarray_get_shape)(array.as_raw(), &mut ndim, &mut data) };
        self.check("MXNDArrayGetShape", rc)?;
        if ndim == 0 {
            return Ok(Shape::default());
        }
        Ok(Shape::from(unsafe { std::slice::from_raw_parts(data, ndim as usize) }))
    }

    fn ndarray_context(&self, array: NDArrayHandle) -> Result<Context> {
        const CALL: &str = "MXNDArrayGetContext";
        let (mut dev_type, mut dev_id): (c_int, c_int) = (0, 0);
        let rc = unsafe { (self.api.ndarray_get_context)(array.as_raw(), &mut dev_type, &mut dev_id) };
        self.check(CALL, rc)?;
        let device_type = DeviceType::from_code(dev_type)
            .ok_or_else(|| Error::engine(CALL, format!("unknown device type {dev_type}")))?;
        Ok(Context::new(device_type, dev_id))
    }

    fn ndarray_copy_from(&self, array: NDArrayHandle, data: &[f32]) -> Result<()> {
        // The size argument counts elements, not bytes.
        let rc = unsafe {
            (self.api.ndarray_sync_copy_from_cpu)(array.as_raw(), data.as_ptr().cast(), data.len())
        };
        self.check("MXNDArraySyncCopyFromCPU", rc)
    }

    fn ndarray_copy_to(&self, array: NDArrayHandle, out: &mut [f32]) -> Result<()> {
        let rc = unsafe {
            (self.api.ndarray_sync_copy_to_cpu)(array.as_raw(), out.as_mut_ptr().cast(), out.len())
        };
        self.check("MXNDArraySyncCopyToCPU", rc)
    }

    fn ndarray_sample_gaussian(&self, array: NDArrayHandle, mu: f32, sigma: f32) -> Result<()> {
        const CALL: &str = "MXImperativeInvoke";
        let creator = self.creator(CALL, "_random_normal")?;
        let shape = self.ndarray_shape(array)?.to_string();
        let keys = CStrings::new(["loc", "scale", "shape"])?;
        let vals = CStrings::new([mu.to_string(), sigma.to_string(), shape])?;

        let mut outputs = [array.as_raw()];
        let mut outputs_ptr = outputs.as_mut_ptr();
        let mut num_outputs: c_int = 1;
        // SAFETY: the engine writes into the provided output array in place.
        let rc = unsafe {
            (self.api.imperative_invoke)(
                creator,
                0,
                ptr::null_mut(),
                &mut num_outputs,
                &mut outputs_ptr,
                keys.len() as c_int,
                keys.as_ptr(),
                vals.as_ptr(),
            )
        };
        self.check(CALL, rc)
    }

    fn free_ndarray(&self, array: NDArrayHandle) -> Result<()> {
        let rc = unsafe { (self.api.ndarray_free)(array.as_raw()) };
        self.check("MXNDArrayFree", rc)
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
        // The C call takes one length for all three arrays.
        if arg_grads.len() != args.len() || grad_reqs.len() != args.len() {
            return Err(Error::engine(
                CALL,
                format!(
                    "{} arguments, {} gradient stores and {} gradient requests must match",
                    args.len(),
                    arg_grads.len(),
                    grad_reqs.len()
                ),
            ));
        }
        let mut in_args = raw_handles(args, NDArrayHandle::as_raw);
        let mut grads = raw_handles(arg_grads, NDArrayHandle::as_raw);
        let mut reqs: Vec<MxUint> = grad_reqs.iter().map(|r| r.code()).collect();
        let mut aux = raw_handles(aux_states, NDArrayHandle::as_raw);
        let mut out = ptr::null_mut();
        let rc = unsafe {
            (self.api.executor_bind)(
                symbol.as_raw(),
                context.device_type.code(),
                context.device_id,
                count(CALL, in_args.len())?,
                ptr_or_null(&mut in_args),
                ptr_or_null(&mut grads),
                if reqs.is_empty() { ptr::null_mut() } else { reqs.as_mut_ptr() },
                count(CALL, aux.len())?,
                ptr_or_null(&mut aux),
                &mut out,
            )
        };
        self.check(CALL, rc)?;
        Ok(ExecutorHandle::from_raw(out))
    }

    fn executor_forward(&self, executor: ExecutorHandle, is_train: bool) -> Result<()> {
        let rc = unsafe { (self.api.executor_forward)(executor.as_raw(), c_int::from(is_train)) };
        self.check("MXExecutorForward", rc)
    }

    fn executor_backward(&self, executor: ExecutorHandle, head_grads: &[NDArrayHandle]) -> Result<()> {
        const CALL: &str = "MXExecutorBackward";
        let mut heads = raw_handles(head_grads, NDArrayHandle::as_raw);
        let rc = unsafe {
            (self.api.executor_backward)(
                executor.as_raw(),
                count(CALL, heads.len())?,
                ptr_or_null(&mut heads),
            )
        };
        self.check(CALL, rc)
    }

    fn executor_outputs(&self, executor: ExecutorHandle) -> Result<Vec<NDArrayHandle>> {
        const CALL: &str = "MXExecutorOutputs";
        let mut size: MxUint = 0;
        let mut array: *mut RawHandle = ptr::null_mut();
        let rc = unsafe { (self.api.executor_outputs)(executor.as_raw(), &mut size, &mut array) };
        self.check(CALL, rc)?;
        if size == 0 {
            return Ok(Vec::new());
        }
        // SAFETY: `array` holds `size` new handles owned by the caller.
        let handles = unsafe { std::slice::from_raw_parts(array, size as usize) };
        Ok(handles.iter().map(|&h| NDArrayHandle::from_raw(h)).collect())
    }

    fn free_executor(&self, executor: ExecutorHandle) -> Result<()> {
        let rc = unsafe { (self.api.executor_free)(executor.as_raw()) };
        self.check("MXExecutorFree", rc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_library_name() {
        let name = default_library_name();
        assert!(name.starts_with("libmxnet."));
    }

    #[test]
    fn test_missing_library_is_library_error() {
        let path = Path::new("/nonexistent/libmxnet-missing.so");
        match NativeEngine::load(path) {
            Err(Error::Library { path: p, .. }) => assert_eq!(p, path),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("loading a missing library succeeded"),
        }
    }
}
