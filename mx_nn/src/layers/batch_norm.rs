//! Batch normalization layer.

use mx_symbol::prelude::*;
use mx_symbol::OperatorBuilder;

/// Parameters of a `BatchNorm` node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchNormParams {
    /// Added to the variance before taking its square root.
    pub eps: f32,
    /// Decay of the moving statistics.
    pub momentum: f32,
    /// Keep the scale at one instead of learning it.
    pub fix_gamma: bool,
}

impl Default for BatchNormParams {
    fn default() -> Self {
        BatchNormParams {
            eps: 1e-3,
            momentum: 0.9,
            fix_gamma: true,
        }
    }
}

/// `BatchNorm` node over axis 1 of `data`.
///
/// Adds the arguments `{name}_gamma` and `{name}_beta` and the auxiliary
/// states `{name}_moving_mean` and `{name}_moving_var`.
pub fn batch_norm<E: Engine + ?Sized>(
    data: &Symbol<E>,
    name: &str,
    params: BatchNormParams,
) -> Result<Symbol<E>> {
    OperatorBuilder::new("BatchNorm")
        .param("eps", params.eps)
        .param("momentum", params.momentum)
        .param("fix_gamma", params.fix_gamma)
        .input("data", data)
        .create(data.engine(), name)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use mx_engine_ref::RefEngine;

    use super::*;

    #[test]
    fn test_batch_norm_states() {
        let engine = Arc::new(RefEngine::new());
        let x = Symbol::variable(&engine, "data").unwrap();
        let bn = batch_norm(&x, "bn1", BatchNormParams::default()).unwrap();
        assert_eq!(bn.list_arguments().unwrap(), vec!["data", "bn1_gamma", "bn1_beta"]);
        assert_eq!(
            bn.list_auxiliary_states().unwrap(),
            vec!["bn1_moving_mean", "bn1_moving_var"]
        );

        let shapes = bn
            .infer_shape(&HashMap::from([("data".to_string(), Shape::new(vec![8, 16]))]))
            .unwrap();
        assert!(shapes.complete);
        assert_eq!(shapes.aux_shapes, vec![Shape::new(vec![16]); 2]);
    }

    #[test]
    fn test_batch_norm_params_round_trip_through_json() {
        let engine = Arc::new(RefEngine::new());
        let x = Symbol::variable(&engine, "data").unwrap();
        let params = BatchNormParams {
            eps: 1e-5,
            momentum: 0.5,
            fix_gamma: false,
        };
        let bn = batch_norm(&x, "bn", params).unwrap();
        let json = bn.to_json().unwrap();
        assert!(json.contains("\"fix_gamma\": \"false\""));
        assert!(json.contains("\"momentum\": \"0.5\""));
    }
}
