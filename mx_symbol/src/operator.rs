//! Builder for engine operator nodes.

use std::fmt::Display;
use std::sync::Arc;

use crate::engine::Engine;
use crate::error::Result;
use crate::symbol::Symbol;

/// Collects an operator's parameters and keyword inputs, then asks the
/// engine to create and compose the node.
///
/// ```ignore
/// let fc = OperatorBuilder::new("FullyConnected")
///     .param("num_hidden", 128)
///     .input("data", &data)
///     .create(&engine, "fc1")?;
/// ```
pub struct OperatorBuilder<'a, E: Engine + ?Sized = dyn Engine> {
    op_name: String,
    params: Vec<(String, String)>,
    inputs: Vec<(String, &'a Symbol<E>)>,
}

impl<'a, E: Engine + ?Sized> OperatorBuilder<'a, E> {
    pub fn new(op_name: &str) -> Self {
        OperatorBuilder {
            op_name: op_name.to_string(),
            params: Vec::new(),
            inputs: Vec::new(),
        }
    }

    /// Set a parameter; values are rendered with `Display`, booleans as
    /// `true`/`false`.
    pub fn param(mut self, key: &str, value: impl Display) -> Self {
        self.params.push((key.to_string(), value.to_string()));
        self
    }

    /// Attach a keyword input. Inputs the engine expects but that are never
    /// attached become variables named `<name>_<key>`.
    pub fn input(mut self, key: &str, symbol: &'a Symbol<E>) -> Self {
        self.inputs.push((key.to_string(), symbol));
        self
    }

    pub fn op_name(&self) -> &str {
        &self.op_name
    }

    /// Create the node on `engine` under `name` (empty: engine-chosen).
    pub fn create(self, engine: &Arc<E>, name: &str) -> Result<Symbol<E>> {
        let config: Vec<(&str, &str)> = self
            .params
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        let inputs: Vec<(&str, &Symbol<E>)> =
            self.inputs.iter().map(|(k, s)| (k.as_str(), *s)).collect();
        Symbol::operator(engine, &self.op_name, name, &inputs, &config)
    }
}
