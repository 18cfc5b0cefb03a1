//! XOR problem training example.
//!
//! Builds a 2 -> 16 -> 1 MLP, binds it on the reference engine and trains it
//! with SGD, computing the mean squared error on the host.

use std::collections::HashMap;
use std::sync::Arc;

use mx_engine_ref::RefEngine;
use mx_nn::{mlp, ActType, Sgd};
use mx_symbol::prelude::*;

fn main() -> Result<()> {
    // XOR dataset
    let inputs = [0.0, 0.0, 0.0, 1.0, 1.0, 0.0, 1.0, 1.0];
    let targets = [0.0, 1.0, 1.0, 0.0];

    let engine = Arc::new(RefEngine::new());
    let data = Symbol::variable(&engine, "data")?;
    let net = mlp(&data, "", &[16, 1], ActType::Tanh)?;

    let x = NDArray::from_slice(&engine, &inputs, &Shape::new(vec![4, 2]), Context::cpu())?;
    let args = HashMap::from([("data".to_string(), x)]);
    let exec = net.simple_bind(Context::cpu(), &args, &HashMap::new(), &HashMap::new())?;
    let out_shape = exec.outputs()[0].shape()?;

    let mut opt = Sgd::with_momentum(0.05, 0.9);

    println!("Training XOR network...\n");

    for epoch in 0..2000 {
        exec.forward(true)?;
        let pred = exec.outputs()[0].to_vec()?;

        // d(mean squared error)/d(pred)
        let loss: f32 = pred.iter().zip(&targets).map(|(p, t)| (p - t) * (p - t)).sum::<f32>() / 4.0;
        let grad: Vec<f32> = pred.iter().zip(&targets).map(|(p, t)| (p - t) / 2.0).collect();
        let head = NDArray::from_slice(&engine, &grad, &out_shape, Context::cpu())?;

        exec.backward(&[head])?;
        opt.update(&exec)?;

        if epoch % 200 == 0 || epoch == 1999 {
            println!("Epoch {:4}: avg loss = {:.6}", epoch, loss);
        }
    }

    // Test the trained network
    println!("\nTesting trained network:");
    println!("========================");
    exec.forward(false)?;
    let pred = exec.outputs()[0].to_vec()?;
    for (i, (p, t)) in pred.iter().zip(&targets).enumerate() {
        println!(
            "  {} XOR {} = {:.3} (expected {})",
            inputs[2 * i],
            inputs[2 * i + 1],
            p,
            t
        );
    }
    Ok(())
}
