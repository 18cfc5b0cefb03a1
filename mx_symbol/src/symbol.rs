//! Symbol wrapper over engine graph-node handles.
//!
//! A `Symbol` is a cheap, clonable reference to a node in the engine's
//! computation graph. Every graph operation is a call into the engine; the
//! wrapper itself only owns the handle and releases it when the last clone
//! goes away.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::engine::{Engine, InferredShapes};
use crate::error::{Error, Result};
use crate::handle::SymbolHandle;
use crate::shape::Shape;

/// Owner of exactly one symbol handle.
///
/// The handle is released through its engine when the blob is dropped, so a
/// blob shared behind an `Arc` is freed once, after the last `Symbol` clone.
pub struct SymBlob<E: Engine + ?Sized = dyn Engine> {
    handle: SymbolHandle,
    engine: Arc<E>,
}

impl<E: Engine + ?Sized> SymBlob<E> {
    /// Take ownership of `handle`, which must have been created by `engine`.
    pub fn new(engine: Arc<E>, handle: SymbolHandle) -> Self {
        debug!(engine = engine.name(), handle = ?handle, "acquired symbol");
        SymBlob { handle, engine }
    }

    pub fn handle(&self) -> SymbolHandle {
        self.handle
    }
}

impl<E: Engine + ?Sized> Drop for SymBlob<E> {
    fn drop(&mut self) {
        debug!(engine = self.engine.name(), handle = ?self.handle, "releasing symbol");
        if let Err(err) = self.engine.free_symbol(self.handle) {
            warn!("failed to release symbol handle {:?}: {err}", self.handle);
        }
    }
}

/// A node of the engine's computation graph (variable or operator).
///
/// Cloning aliases the same engine node; use [`Symbol::copy`] for an
/// independent engine-side copy.
pub struct Symbol<E: Engine + ?Sized = dyn Engine> {
    blob: Arc<SymBlob<E>>,
}

impl<E: Engine + ?Sized> Clone for Symbol<E> {
    fn clone(&self) -> Self {
        Symbol {
            blob: Arc::clone(&self.blob),
        }
    }
}

impl<E: Engine + ?Sized> fmt::Debug for Symbol<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Symbol")
            .field("engine", &self.blob.engine.name())
            .field("handle", &self.blob.handle)
            .finish()
    }
}

pub(crate) fn ensure_same_engine<E: Engine + ?Sized>(a: &Arc<E>, b: &Arc<E>) -> Result<()> {
    if Arc::ptr_eq(a, b) {
        Ok(())
    } else {
        Err(Error::EngineMismatch)
    }
}

impl<E: Engine + ?Sized> Symbol<E> {
    // === Constructors ===

    /// Wrap a handle created by `engine`, taking ownership of it.
    pub fn from_handle(engine: Arc<E>, handle: SymbolHandle) -> Self {
        Symbol {
            blob: Arc::new(SymBlob::new(engine, handle)),
        }
    }

    /// Create a variable node. An empty name lets the engine choose one.
    pub fn variable(engine: &Arc<E>, name: &str) -> Result<Self> {
        let handle = engine.create_variable(name)?;
        Ok(Self::from_handle(Arc::clone(engine), handle))
    }

    /// Create an operator node named `name` over keyword inputs.
    ///
    /// `config` carries the operator's parameters as string pairs, exactly as
    /// the engine receives them.
    pub fn operator(
        engine: &Arc<E>,
        op_name: &str,
        name: &str,
        inputs: &[(&str, &Symbol<E>)],
        config: &[(&str, &str)],
    ) -> Result<Self> {
        let keys: Vec<&str> = inputs.iter().map(|(k, _)| *k).collect();
        let symbols: Vec<&Symbol<E>> = inputs.iter().map(|(_, s)| *s).collect();
        Self::compose_new(engine, op_name, name, &keys, &symbols, config)
    }

    /// Create an operator node and attach `inputs` to it. `keys` is empty for
    /// positional inputs.
    pub(crate) fn compose_new(
        engine: &Arc<E>,
        op_name: &str,
        name: &str,
        keys: &[&str],
        inputs: &[&Symbol<E>],
        config: &[(&str, &str)],
    ) -> Result<Self> {
        for input in inputs {
            ensure_same_engine(engine, input.engine())?;
        }
        let handle = engine.create_operator(op_name, config)?;
        // Owned before composing so a failed compose still releases it.
        let symbol = Self::from_handle(Arc::clone(engine), handle);
        let handles: Vec<SymbolHandle> = inputs.iter().map(|s| s.handle()).collect();
        engine.compose(handle, name, keys, &handles)?;
        Ok(symbol)
    }

    /// Load a graph from the engine's JSON form.
    pub fn from_json(engine: &Arc<E>, json: &str) -> Result<Self> {
        let handle = engine.symbol_from_json(json)?;
        Ok(Self::from_handle(Arc::clone(engine), handle))
    }

    // === Accessors ===

    pub fn handle(&self) -> SymbolHandle {
        self.blob.handle
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.blob.engine
    }

    /// Number of `Symbol` values currently aliasing this handle.
    pub fn alias_count(&self) -> usize {
        Arc::strong_count(&self.blob)
    }

    // === Graph queries ===

    /// Argument names in calling order; unnamed arguments are empty strings.
    pub fn list_arguments(&self) -> Result<Vec<String>> {
        self.engine().list_arguments(self.handle())
    }

    pub fn list_outputs(&self) -> Result<Vec<String>> {
        self.engine().list_outputs(self.handle())
    }

    pub fn list_auxiliary_states(&self) -> Result<Vec<String>> {
        self.engine().list_auxiliary_states(self.handle())
    }

    /// Infer argument, output and auxiliary shapes from the known argument
    /// shapes.
    pub fn infer_shape(&self, arg_shapes: &HashMap<String, Shape>) -> Result<InferredShapes> {
        let known: Vec<(&str, &Shape)> = arg_shapes
            .iter()
            .map(|(name, shape)| (name.as_str(), shape))
            .collect();
        self.engine().infer_shape(self.handle(), &known)
    }

    pub fn to_json(&self) -> Result<String> {
        self.engine().symbol_to_json(self.handle())
    }

    // === Graph construction ===

    /// Ask the engine for an independent copy of this node.
    pub fn copy(&self) -> Result<Self> {
        let handle = self.engine().copy_symbol(self.handle())?;
        Ok(Self::from_handle(Arc::clone(self.engine()), handle))
    }

    fn binary(&self, op_name: &str, rhs: &Symbol<E>) -> Result<Symbol<E>> {
        Self::compose_new(self.engine(), op_name, "", &[], &[self, rhs], &[])
    }
}

// === Operator overloads ===
//
// Each operator asks the engine for a new node, so the output is a `Result`.

macro_rules! impl_binary_op {
    ($trait:ident, $method:ident, $op_name:literal) => {
        impl<E: Engine + ?Sized> std::ops::$trait for &Symbol<E> {
            type Output = Result<Symbol<E>>;

            fn $method(self, rhs: &Symbol<E>) -> Result<Symbol<E>> {
                self.binary($op_name, rhs)
            }
        }

        impl<E: Engine + ?Sized> std::ops::$trait<Symbol<E>> for &Symbol<E> {
            type Output = Result<Symbol<E>>;

            fn $method(self, rhs: Symbol<E>) -> Result<Symbol<E>> {
                self.binary($op_name, &rhs)
            }
        }

        impl<E: Engine + ?Sized> std::ops::$trait<&Symbol<E>> for Symbol<E> {
            type Output = Result<Symbol<E>>;

            fn $method(self, rhs: &Symbol<E>) -> Result<Symbol<E>> {
                self.binary($op_name, rhs)
            }
        }

        impl<E: Engine + ?Sized> std::ops::$trait for Symbol<E> {
            type Output = Result<Symbol<E>>;

            fn $method(self, rhs: Symbol<E>) -> Result<Symbol<E>> {
                self.binary($op_name, &rhs)
            }
        }
    };
}

impl_binary_op!(Add, add, "_Plus");
impl_binary_op!(Sub, sub, "_Minus");
impl_binary_op!(Mul, mul, "_Mul");
impl_binary_op!(Div, div, "_Div");
