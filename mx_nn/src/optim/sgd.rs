//! Stochastic Gradient Descent updater.

use std::collections::HashMap;

use tracing::trace;

use mx_symbol::prelude::*;

/// SGD with optional momentum and weight decay.
///
/// Weights are updated in place through host copies. Momentum buffers are
/// keyed by parameter name, so one updater serves every parameter of a
/// network across steps.
pub struct Sgd {
    /// Learning rate.
    pub learning_rate: f32,
    /// Momentum coefficient.
    pub momentum: f32,
    /// L2 penalty added to each gradient as `weight_decay * weight`.
    pub weight_decay: f32,
    velocities: HashMap<String, Vec<f32>>,
}

impl Sgd {
    /// Create a plain SGD updater.
    pub fn new(learning_rate: f32) -> Self {
        Sgd {
            learning_rate,
            momentum: 0.0,
            weight_decay: 0.0,
            velocities: HashMap::new(),
        }
    }

    /// Create an SGD updater with momentum.
    pub fn with_momentum(learning_rate: f32, momentum: f32) -> Self {
        Sgd {
            momentum,
            ..Sgd::new(learning_rate)
        }
    }

    pub fn weight_decay(mut self, weight_decay: f32) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    /// Update `weight` in place from `grad`.
    pub fn step<E: Engine + ?Sized>(&mut self, name: &str, weight: &NDArray<E>, grad: &NDArray<E>) -> Result<()> {
        let (w_shape, g_shape) = (weight.shape()?, grad.shape()?);
        if w_shape != g_shape {
            return Err(Error::ShapeMismatch {
                expected: w_shape,
                actual: g_shape,
            });
        }
        let mut w = weight.to_vec()?;
        let g = grad.to_vec()?;

        if self.momentum > 0.0 {
            // v = momentum * v + (g + wd * w); w = w - lr * v
            let velocity = self
                .velocities
                .entry(name.to_string())
                .or_insert_with(Vec::new);
            // a rebind may resize a parameter under the same name
            if velocity.len() != w.len() {
                *velocity = vec![0.0; w.len()];
            }
            for i in 0..w.len() {
                velocity[i] = self.momentum * velocity[i] + g[i] + self.weight_decay * w[i];
                w[i] -= self.learning_rate * velocity[i];
            }
        } else {
            // w = w - lr * (g + wd * w)
            for i in 0..w.len() {
                w[i] -= self.learning_rate * (g[i] + self.weight_decay * w[i]);
            }
        }

        trace!(name, numel = w.len(), "sgd step");
        weight.sync_copy_from(&w)
    }

    /// Step every argument of `executor` that requests a gradient.
    pub fn update<E: Engine + ?Sized>(&mut self, executor: &Executor<E>) -> Result<()> {
        let names = executor.symbol().list_arguments()?;
        let params = names
            .iter()
            .zip(executor.arg_arrays())
            .zip(executor.grad_arrays())
            .zip(executor.grad_reqs());
        for (((name, weight), grad), req) in params {
            if *req != OpReqType::NullOp {
                self.step(name, weight, grad)?;
            }
        }
        Ok(())
    }

    /// Forget all momentum buffers.
    ///
    /// A buffer whose parameter changes size is also started afresh.
    pub fn reset(&mut self) {
        self.velocities.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use mx_engine_ref::RefEngine;

    use super::*;

    fn array(engine: &Arc<RefEngine>, data: &[f32]) -> NDArray<RefEngine> {
        NDArray::from_slice(engine, data, &Shape::new(vec![data.len() as u32]), Context::cpu()).unwrap()
    }

    fn assert_close(actual: &[f32], expected: &[f32]) {
        for (a, e) in actual.iter().zip(expected) {
            assert!((a - e).abs() < 1e-6, "{actual:?} != {expected:?}");
        }
    }

    #[test]
    fn test_sgd_step() {
        let engine = Arc::new(RefEngine::new());
        let w = array(&engine, &[1.0, 2.0, 3.0]);
        let g = array(&engine, &[0.1, 0.2, 0.3]);

        let mut opt = Sgd::new(0.1);
        opt.step("w", &w, &g).unwrap();

        // w = w - 0.1 * g
        assert_close(&w.to_vec().unwrap(), &[0.99, 1.98, 2.97]);
    }

    #[test]
    fn test_sgd_with_momentum() {
        let engine = Arc::new(RefEngine::new());
        let w = array(&engine, &[1.0]);
        let g = array(&engine, &[1.0]);

        let mut opt = Sgd::with_momentum(0.1, 0.9);

        // v = 0.9 * 0 + 1 = 1, w = 1 - 0.1 * 1 = 0.9
        opt.step("w", &w, &g).unwrap();
        assert_close(&w.to_vec().unwrap(), &[0.9]);

        // v = 0.9 * 1 + 1 = 1.9, w = 0.9 - 0.19 = 0.71
        opt.step("w", &w, &g).unwrap();
        assert_close(&w.to_vec().unwrap(), &[0.71]);

        opt.reset();
        opt.step("w", &w, &g).unwrap();
        assert_close(&w.to_vec().unwrap(), &[0.61]);
    }

    #[test]
    fn test_sgd_momentum_survives_resized_parameter() {
        let engine = Arc::new(RefEngine::new());
        let g1 = array(&engine, &[1.0]);
        let w1 = array(&engine, &[1.0]);

        let mut opt = Sgd::with_momentum(0.1, 0.9);
        opt.step("w", &w1, &g1).unwrap();
        assert_close(&w1.to_vec().unwrap(), &[0.9]);

        // same name, three elements: the old buffer is dropped, not indexed
        let w3 = array(&engine, &[1.0, 2.0, 3.0]);
        let g3 = array(&engine, &[1.0, 1.0, 1.0]);
        opt.step("w", &w3, &g3).unwrap();
        assert_close(&w3.to_vec().unwrap(), &[0.9, 1.9, 2.9]);

        // v = 0.9 * 1 + 1 = 1.9 for every element
        opt.step("w", &w3, &g3).unwrap();
        assert_close(&w3.to_vec().unwrap(), &[0.71, 1.71, 2.71]);
    }

    #[test]
    fn test_sgd_weight_decay() {
        let engine = Arc::new(RefEngine::new());
        let w = array(&engine, &[2.0]);
        let g = array(&engine, &[0.0]);

        let mut opt = Sgd::new(0.5).weight_decay(0.1);
        // w = 2 - 0.5 * (0 + 0.1 * 2) = 1.9
        opt.step("w", &w, &g).unwrap();
        assert_close(&w.to_vec().unwrap(), &[1.9]);
    }

    #[test]
    fn test_sgd_shape_mismatch() {
        let engine = Arc::new(RefEngine::new());
        let w = array(&engine, &[1.0, 2.0]);
        let g = array(&engine, &[1.0]);
        let err = Sgd::new(0.1).step("w", &w, &g).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
    }
}
