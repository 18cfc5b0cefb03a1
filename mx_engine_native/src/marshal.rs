//! Conversions between Rust values and the C ABI's array conventions.

use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::ptr;

use mx_symbol::{Error, Result, Shape};

use crate::ffi::MxUint;

/// Nul-terminated copies of a list of strings with a pointer array over them.
pub struct CStrings {
    _owned: Vec<CString>,
    ptrs: Vec<*const c_char>,
}

impl CStrings {
    pub fn new<S: AsRef<str>>(items: impl IntoIterator<Item = S>) -> Result<Self> {
        let owned = items
            .into_iter()
            .map(|s| CString::new(s.as_ref()))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let ptrs = owned.iter().map(|s| s.as_ptr()).collect();
        Ok(CStrings { _owned: owned, ptrs })
    }

    pub fn len(&self) -> usize {
        self.ptrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ptrs.is_empty()
    }

    /// Pointer to the array, or null when there are no strings.
    pub fn as_ptr(&self) -> *const *const c_char {
        if self.ptrs.is_empty() {
            ptr::null()
        } else {
            self.ptrs.as_ptr()
        }
    }
}

/// Convert a length to the engine's `mx_uint`.
pub fn count(call: &'static str, n: usize) -> Result<MxUint> {
    MxUint::try_from(n).map_err(|_| Error::engine(call, format!("{n} items exceed the engine's limit")))
}

/// Shapes in compressed form: `ind_ptr[i]..ind_ptr[i + 1]` indexes the
/// dimensions of shape `i` in `data`.
pub fn flatten_shapes(shapes: &[&Shape]) -> (Vec<MxUint>, Vec<MxUint>) {
    let mut ind_ptr = Vec::with_capacity(shapes.len() + 1);
    let mut data = Vec::new();
    ind_ptr.push(0);
    for shape in shapes {
        data.extend_from_slice(shape.dims());
        ind_ptr.push(data.len() as MxUint);
    }
    (ind_ptr, data)
}

/// Copy a string owned by the engine.
///
/// # Safety
/// `ptr` must be null or point to a nul-terminated string that stays valid
/// for the duration of the call.
pub unsafe fn read_str(call: &'static str, ptr: *const c_char) -> Result<String> {
    if ptr.is_null() {
        return Ok(String::new());
    }
    CStr::from_ptr(ptr)
        .to_str()
        .map(str::to_string)
        .map_err(|_| Error::Utf8 { call })
}

/// Copy an engine-owned array of `size` strings.
///
/// # Safety
/// `array` must point to `size` valid string pointers (see [`read_str`]).
pub unsafe fn read_strings(call: &'static str, size: MxUint, array: *const *const c_char) -> Result<Vec<String>> {
    if size == 0 {
        return Ok(Vec::new());
    }
    std::slice::from_raw_parts(array, size as usize)
        .iter()
        .map(|&p| read_str(call, p))
        .collect()
}

/// Copy `size` engine-owned shapes given as parallel rank and dimension
/// arrays.
///
/// # Safety
/// `ndim` must point to `size` ranks and `data` to `size` pointers, each
/// addressing that many dimensions.
pub unsafe fn read_shapes(size: MxUint, ndim: *const MxUint, data: *const *const MxUint) -> Vec<Shape> {
    if size == 0 {
        return Vec::new();
    }
    let ranks = std::slice::from_raw_parts(ndim, size as usize);
    let dims = std::slice::from_raw_parts(data, size as usize);
    ranks
        .iter()
        .zip(dims)
        .map(|(&rank, &ptr)| {
            if rank == 0 {
                Shape::default()
            } else {
                Shape::from(std::slice::from_raw_parts(ptr, rank as usize))
            }
        })
        .collect()
}
