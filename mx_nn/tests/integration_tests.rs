//! Integration tests for training networks through bound executors.
//!
//! The reference engine has no loss operators, so the mean squared error and
//! its head gradient are computed on the host.

use std::collections::HashMap;
use std::sync::Arc;

use mx_engine_ref::RefEngine;
use mx_nn::{fully_connected, mlp, ActType, Sgd};
use mx_symbol::prelude::*;

// ============================================================================
// Test Utilities
// ============================================================================

fn batch(engine: &Arc<RefEngine>, rows: &[[f32; 2]]) -> NDArray<RefEngine> {
    let flat: Vec<f32> = rows.iter().flatten().copied().collect();
    let shape = Shape::new(vec![rows.len() as u32, 2]);
    NDArray::from_slice(engine, &flat, &shape, Context::cpu()).unwrap()
}

/// Mean squared error of the current outputs against `targets`.
fn mse(exec: &Executor<RefEngine>, targets: &[f32]) -> f32 {
    exec.forward(false).unwrap();
    let pred = exec.outputs()[0].to_vec().unwrap();
    pred.iter()
        .zip(targets)
        .map(|(p, t)| (p - t) * (p - t))
        .sum::<f32>()
        / pred.len() as f32
}

/// One forward/backward pass with an MSE head gradient; returns the loss.
fn mse_backward(engine: &Arc<RefEngine>, exec: &Executor<RefEngine>, targets: &[f32]) -> f32 {
    exec.forward(true).unwrap();
    let output = &exec.outputs()[0];
    let pred = output.to_vec().unwrap();
    let n = pred.len() as f32;

    let loss = pred.iter().zip(targets).map(|(p, t)| (p - t) * (p - t)).sum::<f32>() / n;
    let head: Vec<f32> = pred.iter().zip(targets).map(|(p, t)| 2.0 * (p - t) / n).collect();
    let head = NDArray::from_slice(engine, &head, &output.shape().unwrap(), Context::cpu()).unwrap();
    exec.backward(&[head]).unwrap();
    loss
}

// ============================================================================
// Test: Linear Regression
// ============================================================================

#[test]
fn test_linear_regression_converges() {
    eprintln!("\n=== Linear Regression ===");

    // y = 2 * x0 - 3 * x1 + 1
    let rows = [
        [-1.0, -1.0],
        [-1.0, 0.5],
        [-0.5, 1.0],
        [0.0, -0.5],
        [0.0, 0.0],
        [0.5, 0.5],
        [1.0, -1.0],
        [1.0, 1.0],
    ];
    let targets: Vec<f32> = rows.iter().map(|r| 2.0 * r[0] - 3.0 * r[1] + 1.0).collect();

    let engine = Arc::new(RefEngine::with_seed(3));
    let data = Symbol::variable(&engine, "data").unwrap();
    let net = fully_connected(&data, "fc", 1, false).unwrap();

    let args = HashMap::from([("data".to_string(), batch(&engine, &rows))]);
    let exec = net
        .simple_bind(Context::cpu(), &args, &HashMap::new(), &HashMap::new())
        .unwrap();

    let mut opt = Sgd::new(0.1);
    for epoch in 0..500 {
        let loss = mse_backward(&engine, &exec, &targets);
        opt.update(&exec).unwrap();
        if epoch % 100 == 0 {
            eprintln!("  Epoch {:4}: loss = {:.6}", epoch, loss);
        }
    }

    let params = exec.arg_dict().unwrap();
    let weight = params["fc_weight"].to_vec().unwrap();
    let bias = params["fc_bias"].to_vec().unwrap();
    eprintln!("  weight = {weight:?}, bias = {bias:?}");
    assert!((weight[0] - 2.0).abs() < 0.05);
    assert!((weight[1] + 3.0).abs() < 0.05);
    assert!((bias[0] - 1.0).abs() < 0.05);
    assert!(mse(&exec, &targets) < 1e-3);
}

// ============================================================================
// Test: XOR with a hidden layer
// ============================================================================

#[test]
fn test_xor_mlp_reduces_loss() {
    eprintln!("\n=== XOR MLP ===");

    let rows = [[0.0, 0.0], [0.0, 1.0], [1.0, 0.0], [1.0, 1.0]];
    let targets = [0.0, 1.0, 1.0, 0.0];

    let engine = Arc::new(RefEngine::with_seed(5));
    let data = Symbol::variable(&engine, "data").unwrap();
    let net = mlp(&data, "", &[8, 1], ActType::Tanh).unwrap();

    let args = HashMap::from([("data".to_string(), batch(&engine, &rows))]);
    let exec = net
        .simple_bind(Context::cpu(), &args, &HashMap::new(), &HashMap::new())
        .unwrap();

    let initial = mse(&exec, &targets);
    let mut opt = Sgd::with_momentum(0.05, 0.9);
    for epoch in 0..1000 {
        let loss = mse_backward(&engine, &exec, &targets);
        opt.update(&exec).unwrap();
        if epoch % 200 == 0 {
            eprintln!("  Epoch {:4}: loss = {:.6}", epoch, loss);
        }
    }
    let last = mse(&exec, &targets);
    eprintln!("  initial = {initial:.4}, final = {last:.4}");
    assert!(last < initial * 0.5, "loss went from {initial} to {last}");
}

// ============================================================================
// Test: Updater respects gradient requests
// ============================================================================

#[test]
fn test_update_leaves_inputs_untouched() {
    let engine = Arc::new(RefEngine::with_seed(9));
    let data = Symbol::variable(&engine, "data").unwrap();
    let net = fully_connected(&data, "fc", 3, false).unwrap();

    let rows = [[0.5, -0.5], [1.0, 2.0]];
    let args = HashMap::from([("data".to_string(), batch(&engine, &rows))]);
    let exec = net
        .simple_bind(Context::cpu(), &args, &HashMap::new(), &HashMap::new())
        .unwrap();

    let before = exec.arg_dict().unwrap();
    let data_before = before["data"].to_vec().unwrap();
    let weight_before = before["fc_weight"].to_vec().unwrap();

    mse_backward(&engine, &exec, &[0.0; 6]);
    Sgd::new(0.1).update(&exec).unwrap();

    let after = exec.arg_dict().unwrap();
    assert_eq!(after["data"].to_vec().unwrap(), data_before);
    assert_ne!(after["fc_weight"].to_vec().unwrap(), weight_before);
}
