//! Raw C ABI of the engine library, resolved at run time.

use std::os::raw::{c_char, c_int, c_void};
use std::path::Path;

use libloading::Library;
use mx_symbol::{Error, Result};

pub type MxUint = u32;
pub type RawHandle = *mut c_void;
pub type AtomicSymbolCreator = *mut c_void;

type GetLastErrorFn = unsafe extern "C" fn() -> *const c_char;
type SymbolCreateVariableFn = unsafe extern "C" fn(name: *const c_char, out: *mut RawHandle) -> c_int;
type SymbolListAtomicSymbolCreatorsFn =
    unsafe extern "C" fn(out_size: *mut MxUint, out_array: *mut *mut AtomicSymbolCreator) -> c_int;
type SymbolGetAtomicSymbolNameFn =
    unsafe extern "C" fn(creator: AtomicSymbolCreator, name: *mut *const c_char) -> c_int;
type SymbolCreateAtomicSymbolFn = unsafe extern "C" fn(
    creator: AtomicSymbolCreator,
    num_param: MxUint,
    keys: *const *const c_char,
    vals: *const *const c_char,
    out: *mut RawHandle,
) -> c_int;
type SymbolComposeFn = unsafe extern "C" fn(
    symbol: RawHandle,
    name: *const c_char,
    num_args: MxUint,
    keys: *const *const c_char,
    args: *const RawHandle,
) -> c_int;
type SymbolCopyFn = unsafe extern "C" fn(symbol: RawHandle, out: *mut RawHandle) -> c_int;
type SymbolFreeFn = unsafe extern "C" fn(symbol: RawHandle) -> c_int;
type SymbolListStringsFn = unsafe extern "C" fn(
    symbol: RawHandle,
    out_size: *mut MxUint,
    out_str_array: *mut *const *const c_char,
) -> c_int;
type SymbolInferShapeFn = unsafe extern "C" fn(
    symbol: RawHandle,
    num_args: MxUint,
    keys: *const *const c_char,
    arg_ind_ptr: *const MxUint,
    arg_shape_data: *const MxUint,
    in_shape_size: *mut MxUint,
    in_shape_ndim: *mut *const MxUint,
    in_shape_data: *mut *const *const MxUint,
    out_shape_size: *mut MxUint,
    out_shape_ndim: *mut *const MxUint,
    out_shape_data: *mut *const *const MxUint,
    aux_shape_size: *mut MxUint,
    aux_shape_ndim: *mut *const MxUint,
    aux_shape_data: *mut *const *const MxUint,
    complete: *mut c_int,
) -> c_int;
type SymbolSaveToJsonFn = unsafe extern "C" fn(symbol: RawHandle, out_json: *mut *const c_char) -> c_int;
type SymbolCreateFromJsonFn = unsafe extern "C" fn(json: *const c_char, out: *mut RawHandle) -> c_int;

type NDArrayCreateFn = unsafe extern "C" fn(
    shape: *const MxUint,
    ndim: MxUint,
    dev_type: c_int,
    dev_id: c_int,
    delay_alloc: c_int,
    out: *mut RawHandle,
) -> c_int;
type NDArrayGetShapeFn =
    unsafe extern "C" fn(array: RawHandle, out_dim: *mut MxUint, out_pdata: *mut *const MxUint) -> c_int;
type NDArrayGetContextFn =
    unsafe extern "C" fn(array: RawHandle, out_dev_type: *mut c_int, out_dev_id: *mut c_int) -> c_int;
type NDArraySyncCopyFromCpuFn = unsafe extern "C" fn(array: RawHandle, data: *const c_void, size: usize) -> c_int;
type NDArraySyncCopyToCpuFn = unsafe extern "C" fn(array: RawHandle, data: *mut c_void, size: usize) -> c_int;
type NDArrayFreeFn = unsafe extern "C" fn(array: RawHandle) -> c_int;
type ImperativeInvokeFn = unsafe extern "C" fn(
    creator: AtomicSymbolCreator,
    num_inputs: c_int,
    inputs: *mut RawHandle,
    num_outputs: *mut c_int,
    outputs: *mut *mut RawHandle,
    num_params: c_int,
    param_keys: *const *const c_char,
    param_vals: *const *const c_char,
) -> c_int;

type ExecutorBindFn = unsafe extern "C" fn(
    symbol: RawHandle,
    dev_type: c_int,
    dev_id: c_int,
    len: MxUint,
    in_args: *mut RawHandle,
    arg_grad_store: *mut RawHandle,
    grad_req_type: *mut MxUint,
    aux_states_len: MxUint,
    aux_states: *mut RawHandle,
    out: *mut RawHandle,
) -> c_int;
type ExecutorForwardFn = unsafe extern "C" fn(executor: RawHandle, is_train: c_int) -> c_int;
type ExecutorBackwardFn =
    unsafe extern "C" fn(executor: RawHandle, len: MxUint, head_grads: *mut RawHandle) -> c_int;
type ExecutorOutputsFn =
    unsafe extern "C" fn(executor: RawHandle, out_size: *mut MxUint, out: *mut *mut RawHandle) -> c_int;
type ExecutorFreeFn = unsafe extern "C" fn(executor: RawHandle) -> c_int;

/// Every engine entry point the adapter calls.
pub struct Api {
    pub get_last_error: GetLastErrorFn,
    pub symbol_create_variable: SymbolCreateVariableFn,
    pub symbol_list_atomic_symbol_creators: SymbolListAtomicSymbolCreatorsFn,
    pub symbol_get_atomic_symbol_name: SymbolGetAtomicSymbolNameFn,
    pub symbol_create_atomic_symbol: SymbolCreateAtomicSymbolFn,
    pub symbol_compose: SymbolComposeFn,
    pub symbol_copy: SymbolCopyFn,
    pub symbol_free: SymbolFreeFn,
    pub symbol_list_arguments: SymbolListStringsFn,
    pub symbol_list_outputs: SymbolListStringsFn,
    pub symbol_list_auxiliary_states: SymbolListStringsFn,
    pub symbol_infer_shape: SymbolInferShapeFn,
    pub symbol_save_to_json: SymbolSaveToJsonFn,
    pub symbol_create_from_json: SymbolCreateFromJsonFn,
    pub ndarray_create: NDArrayCreateFn,
    pub ndarray_get_shape: NDArrayGetShapeFn,
    pub ndarray_get_context: NDArrayGetContextFn,
    pub ndarray_sync_copy_from_cpu: NDArraySyncCopyFromCpuFn,
    pub ndarray_sync_copy_to_cpu: NDArraySyncCopyToCpuFn,
    pub ndarray_free: NDArrayFreeFn,
    pub imperative_invoke: ImperativeInvokeFn,
    pub executor_bind: ExecutorBindFn,
    pub executor_forward: ExecutorForwardFn,
    pub executor_backward: ExecutorBackwardFn,
    pub executor_outputs: ExecutorOutputsFn,
    pub executor_free: ExecutorFreeFn,
}

fn load_symbol<T: Copy>(lib: &Library, path: &Path, name: &'static [u8]) -> Result<T> {
    // SAFETY: each call site names the C signature declared for that symbol.
    let sym = unsafe { lib.get::<T>(name) }.map_err(|err| Error::Library {
        path: path.to_path_buf(),
        message: format!(
            "failed to resolve {}: {err}",
            String::from_utf8_lossy(&name[..name.len() - 1])
        ),
    })?;
    Ok(*sym)
}

/// Open the library at `path` and resolve every entry point.
pub fn load(path: &Path) -> Result<(Library, Api)> {
    // SAFETY: loading runs the library's initialisers; the engine library
    // has no requirements beyond being loaded once per handle.
    let lib = unsafe { Library::new(path) }.map_err(|err| Error::Library {
        path: path.to_path_buf(),
        message: err.to_string(),
    })?;

    let api = Api {
        get_last_error: load_symbol(&lib, path, b"MXGetLastError\0")?,
        symbol_create_variable: load_symbol(&lib, path, b"MXSymbolCreateVariable\0")?,
        symbol_list_atomic_symbol_creators: load_symbol(&lib, path, b"MXSymbolListAtomicSymbolCreators\0")?,
        symbol_get_atomic_symbol_name: load_symbol(&lib, path, b"MXSymbolGetAtomicSymbolName\0")?,
        symbol_create_atomic_symbol: load_symbol(&lib, path, b"MXSymbolCreateAtomicSymbol\0")?,
        symbol_compose: load_symbol(&lib, path, b"MXSymbolCompose\0")?,
        symbol_copy: load_symbol(&lib, path, b"MXSymbolCopy\0")?,
        symbol_free: load_symbol(&lib, path, b"MXSymbolFree\0")?,
        symbol_list_arguments: load_symbol(&lib, path, b"MXSymbolListArguments\0")?,
        symbol_list_outputs: load_symbol(&lib, path, b"MXSymbolListOutputs\0")?,
        symbol_list_auxiliary_states: load_symbol(&lib, path, b"MXSymbolListAuxiliaryStates\0")?,
        symbol_infer_shape: load_symbol(&lib, path, b"MXSymbolInferShape\0")?,
        symbol_save_to_json: load_symbol(&lib, path, b"MXSymbolSaveToJSON\0")?,
        symbol_create_from_json: load_symbol(&lib, path, b"MXSymbolCreateFromJSON\0")?,
        ndarray_create: load_symbol(&lib, path, b"MXNDArrayCreate\0")?,
        ndarray_get_shape: load_symbol(&lib, path, b"MXNDArrayGetShape\0")?,
        ndarray_get_context: load_symbol(&lib, path, b"MXNDArrayGetContext\0")?,
        ndarray_sync_copy_from_cpu: load_symbol(&lib, path, b"MXNDArraySyncCopyFromCPU\0")?,
        ndarray_sync_copy_to_cpu: load_symbol(&lib, path, b"MXNDArraySyncCopyToCPU\0")?,
        ndarray_free: load_symbol(&lib, path, b"MXNDArrayFree\0")?,
        imperative_invoke: load_symbol(&lib, path, b"MXImperativeInvoke\0")?,
        executor_bind: load_symbol(&lib, path, b"MXExecutorBind\0")?,
        executor_forward: load_symbol(&lib, path, b"MXExecutorForward\0")?,
        executor_backward: load_symbol(&lib, path, b"MXExecutorBackward\0")?,
        executor_outputs: load_symbol(&lib, path, b"MXExecutorOutputs\0")?,
        executor_free: load_symbol(&lib, path, b"MXExecutorFree\0")?,
    };
    Ok((lib, api))
}
