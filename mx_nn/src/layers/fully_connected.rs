//! Fully connected layer: y = x @ W^T + b

use mx_symbol::prelude::*;
use mx_symbol::OperatorBuilder;

/// `FullyConnected` node with `num_hidden` outputs.
///
/// Adds the arguments `{name}_weight` with shape `[num_hidden, features]`
/// and, unless `no_bias`, `{name}_bias` with shape `[num_hidden]`. Inputs of
/// rank above two are flattened to `[batch, features]`.
pub fn fully_connected<E: Engine + ?Sized>(
    data: &Symbol<E>,
    name: &str,
    num_hidden: u32,
    no_bias: bool,
) -> Result<Symbol<E>> {
    OperatorBuilder::new("FullyConnected")
        .param("num_hidden", num_hidden)
        .param("no_bias", no_bias)
        .input("data", data)
        .create(data.engine(), name)
}
