//! Opaque engine handles.
//!
//! Each handle is the raw pointer the engine's C ABI hands out. The bindings
//! never dereference them; they only pass them back to the engine that
//! created them.

use std::os::raw::c_void;

macro_rules! opaque_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[repr(transparent)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(*mut c_void);

        impl $name {
            /// Wrap a raw handle returned by the engine.
            pub fn from_raw(ptr: *mut c_void) -> Self {
                $name(ptr)
            }

            /// The raw handle, for passing back across the C ABI.
            pub fn as_raw(self) -> *mut c_void {
                self.0
            }

            pub fn is_null(self) -> bool {
                self.0.is_null()
            }
        }

        // Handles are plain identifiers; the engine serialises access to
        // the objects behind them.
        unsafe impl Send for $name {}
        unsafe impl Sync for $name {}
    };
}

opaque_handle!(
    /// Handle to a node (or group of outputs) in the engine's graph.
    SymbolHandle
);
opaque_handle!(
    /// Handle to an engine-owned n-dimensional array.
    NDArrayHandle
);
opaque_handle!(
    /// Handle to an engine-side bound computation plan.
    ExecutorHandle
);
