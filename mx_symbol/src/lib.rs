//! # mx_symbol - Symbolic-graph bindings for an external tensor engine
//!
//! The engine owns everything interesting: graph construction, shape
//! inference, array allocation and execution. This crate marshals calls into
//! it through the [`Engine`] trait and manages handle lifetimes.
//!
//! ## Overview
//!
//! - [`Symbol`] - Reference-counted handle to an engine graph node. Cloning
//!   aliases the node; the engine handle is released once, after the last
//!   clone is dropped.
//! - [`NDArray`] - Reference-counted handle to an engine array.
//! - [`Executor`] - Exclusively owned bound graph; released on drop or with
//!   [`Executor::free`].
//! - [`OperatorBuilder`] - Parameters and inputs for an engine operator.
//! - [`Engine`] - The engine's C ABI as a trait; see `mx_engine_native` and
//!   `mx_engine_ref` for implementations.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use mx_symbol::prelude::*;
//! use mx_engine_ref::RefEngine;
//!
//! let engine = Arc::new(RefEngine::new());
//! let x = Symbol::variable(&engine, "x")?;
//! let y = Symbol::variable(&engine, "y")?;
//! let z = (&x + &y)?;
//! assert_eq!(z.list_arguments()?, vec!["x", "y"]);
//! ```

pub mod bind;
pub mod context;
pub mod engine;
pub mod error;
pub mod executor;
pub mod handle;
pub mod ndarray;
pub mod operator;
pub mod shape;
pub mod symbol;

pub use bind::ExecutorArrays;
pub use context::{Context, DeviceType, OpReqType, ParseContextError};
pub use engine::{Engine, InferredShapes};
pub use error::{Error, Result};
pub use executor::Executor;
pub use handle::{ExecutorHandle, NDArrayHandle, SymbolHandle};
pub use ndarray::NDArray;
pub use operator::OperatorBuilder;
pub use shape::{ParseShapeError, Shape};
pub use symbol::{SymBlob, Symbol};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::context::{Context, DeviceType, OpReqType};
    pub use crate::engine::{Engine, InferredShapes};
    pub use crate::error::{Error, Result};
    pub use crate::executor::Executor;
    pub use crate::ndarray::NDArray;
    pub use crate::operator::OperatorBuilder;
    pub use crate::shape::Shape;
    pub use crate::symbol::Symbol;
}
