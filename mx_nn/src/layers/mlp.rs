//! Multi-layer perceptron.

use tracing::debug;

use mx_symbol::prelude::*;

use super::fully_connected;
use crate::activations::{activation, ActType};

/// Stack of fully connected layers, one per entry of `hidden`, with `act`
/// between consecutive layers and none after the last.
///
/// Layers are named `{prefix}fc1`, `{prefix}fc2`, ... and activations
/// `{prefix}act1`, `{prefix}act2`, ...
pub fn mlp<E: Engine + ?Sized>(
    data: &Symbol<E>,
    prefix: &str,
    hidden: &[u32],
    act: ActType,
) -> Result<Symbol<E>> {
    let mut out = data.clone();
    for (i, &units) in hidden.iter().enumerate() {
        let layer = i + 1;
        out = fully_connected(&out, &format!("{prefix}fc{layer}"), units, false)?;
        if layer < hidden.len() {
            out = activation(&out, &format!("{prefix}act{layer}"), act)?;
        }
    }
    debug!(prefix, layers = hidden.len(), %act, "built mlp");
    Ok(out)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use mx_engine_ref::RefEngine;

    use super::*;

    #[test]
    fn test_mlp_arguments_and_shapes() {
        let engine = Arc::new(RefEngine::new());
        let x = Symbol::variable(&engine, "data").unwrap();
        let net = mlp(&x, "net_", &[8, 4, 1], ActType::Relu).unwrap();

        assert_eq!(
            net.list_arguments().unwrap(),
            vec![
                "data",
                "net_fc1_weight",
                "net_fc1_bias",
                "net_fc2_weight",
                "net_fc2_bias",
                "net_fc3_weight",
                "net_fc3_bias",
            ]
        );
        assert_eq!(net.list_outputs().unwrap(), vec!["net_fc3_output"]);

        let shapes = net
            .infer_shape(&HashMap::from([("data".to_string(), Shape::new(vec![5, 3]))]))
            .unwrap();
        assert!(shapes.complete);
        assert_eq!(shapes.arg_shapes[1], Shape::new(vec![8, 3]));
        assert_eq!(shapes.arg_shapes[3], Shape::new(vec![4, 8]));
        assert_eq!(shapes.out_shapes, vec![Shape::new(vec![5, 1])]);
    }

    #[test]
    fn test_mlp_without_layers_is_identity() {
        let engine = Arc::new(RefEngine::new());
        let x = Symbol::variable(&engine, "data").unwrap();
        let net = mlp(&x, "", &[], ActType::Tanh).unwrap();
        assert_eq!(net.handle(), x.handle());
    }
}
