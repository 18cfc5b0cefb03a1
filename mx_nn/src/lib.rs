//! # mx_nn - Neural Network Building Blocks for mx_symbol
//!
//! Typed constructors for the engine's neural-network operators and a host
//! side parameter updater:
//!
//! - **Layers**: `fully_connected`, `batch_norm`, `mlp`
//! - **Activations**: ReLU, Sigmoid, Tanh
//! - **Updaters**: SGD (with momentum and weight decay)
//!
//! ## Example: Training a Simple MLP
//!
//! ```ignore
//! use std::collections::HashMap;
//! use std::sync::Arc;
//! use mx_engine_ref::RefEngine;
//! use mx_nn::{mlp, ActType, Sgd};
//! use mx_symbol::prelude::*;
//!
//! let engine = Arc::new(RefEngine::new());
//! let data = Symbol::variable(&engine, "data")?;
//! let net = mlp(&data, "", &[4, 1], ActType::Tanh)?;
//!
//! let inputs = NDArray::from_slice(&engine, &[0.0, 1.0], &Shape::new(vec![1, 2]), Context::cpu())?;
//! let args = HashMap::from([("data".to_string(), inputs)]);
//! let exec = net.simple_bind(Context::cpu(), &args, &HashMap::new(), &HashMap::new())?;
//!
//! let mut opt = Sgd::new(0.1);
//! for _ in 0..100 {
//!     exec.forward(true)?;
//!     // Head gradient of the loss with respect to the output
//!     let head = NDArray::from_slice(&engine, &[1.0], &Shape::new(vec![1, 1]), Context::cpu())?;
//!     exec.backward(&[head])?;
//!     opt.update(&exec)?;
//! }
//! ```

pub mod activations;
pub mod layers;
pub mod optim;

// Re-exports for convenience
pub use activations::{activation, relu, sigmoid, tanh, ActType, ParseActTypeError};
pub use layers::{batch_norm, fully_connected, mlp, BatchNormParams};
pub use optim::Sgd;
