//! End-to-end tests of the symbol bindings running on the reference engine.

use std::collections::HashMap;
use std::sync::Arc;

use mx_engine_ref::RefEngine;
use mx_symbol::prelude::*;

// ============================================================================
// Test Utilities
// ============================================================================

fn engine() -> Arc<RefEngine> {
    Arc::new(RefEngine::with_seed(7))
}

fn shape(dims: &[u32]) -> Shape {
    Shape::new(dims.to_vec())
}

fn array(engine: &Arc<RefEngine>, data: &[f32], dims: &[u32]) -> NDArray<RefEngine> {
    NDArray::from_slice(engine, data, &shape(dims), Context::cpu()).unwrap()
}

fn assert_close(actual: &[f32], expected: &[f32]) {
    assert_eq!(actual.len(), expected.len());
    for (a, e) in actual.iter().zip(expected) {
        assert!((a - e).abs() < 1e-5, "{actual:?} != {expected:?}");
    }
}

// ============================================================================
// Graph construction
// ============================================================================

#[test]
fn test_sum_lists_arguments_and_outputs() {
    let engine = engine();
    let x = Symbol::variable(&engine, "x").unwrap();
    let y = Symbol::variable(&engine, "y").unwrap();
    let z = (&x + &y).unwrap();

    assert_eq!(z.list_arguments().unwrap(), vec!["x", "y"]);
    assert_eq!(z.list_outputs().unwrap(), vec!["_plus0_output"]);
    assert!(z.list_auxiliary_states().unwrap().is_empty());

    let w = (&z * &x).unwrap();
    assert_eq!(w.list_outputs().unwrap(), vec!["_mul0_output"]);
    assert_eq!(w.list_arguments().unwrap(), vec!["x", "y"]);
}

#[test]
fn test_variable_lists_itself() {
    let engine = engine();
    let x = Symbol::variable(&engine, "x").unwrap();
    assert_eq!(x.list_arguments().unwrap(), vec!["x"]);
    assert_eq!(x.list_outputs().unwrap(), vec!["x"]);
}

#[test]
fn test_keyword_operator_names_hidden_inputs() {
    let engine = engine();
    let data = Symbol::variable(&engine, "data").unwrap();
    let fc = OperatorBuilder::new("FullyConnected")
        .param("num_hidden", 10)
        .input("data", &data)
        .create(&engine, "fc1")
        .unwrap();
    assert_eq!(
        fc.list_arguments().unwrap(),
        vec!["data", "fc1_weight", "fc1_bias"]
    );
    assert_eq!(fc.list_outputs().unwrap(), vec!["fc1_output"]);
}

#[test]
fn test_unknown_operator_is_engine_error() {
    let engine = engine();
    let data = Symbol::variable(&engine, "data").unwrap();
    let err = Symbol::operator(&engine, "Convolution", "c", &[("data", &data)], &[]).unwrap_err();
    assert_eq!(err.call(), Some("MXSymbolCreateAtomicSymbol"));
    assert!(err.to_string().contains("Convolution"));
}

#[test]
fn test_failed_compose_leaks_nothing() {
    let engine = engine();
    let data = Symbol::variable(&engine, "data").unwrap();
    let err = Symbol::operator(
        &engine,
        "Activation",
        "act",
        &[("input", &data)],
        &[("act_type", "relu")],
    )
    .unwrap_err();
    assert_eq!(err.call(), Some("MXSymbolCompose"));
    assert_eq!(engine.live_handles().symbols, 1);
}

#[test]
fn test_handles_released_after_last_alias() {
    let engine = engine();
    {
        let x = Symbol::variable(&engine, "x").unwrap();
        let y = Symbol::variable(&engine, "y").unwrap();
        let z = (&x - &y).unwrap();
        let alias = z.clone();
        drop(z);
        assert_eq!(alias.list_arguments().unwrap(), vec!["x", "y"]);
        assert_eq!(engine.live_handles().symbols, 3);
    }
    assert_eq!(engine.live_handles().symbols, 0);
}

#[test]
fn test_copy_is_independent_handle() {
    let engine = engine();
    let x = Symbol::variable(&engine, "x").unwrap();
    let copy = x.copy().unwrap();
    assert_ne!(copy.handle(), x.handle());
    drop(x);
    assert_eq!(copy.list_arguments().unwrap(), vec!["x"]);
}

#[test]
fn test_json_round_trip() {
    let engine = engine();
    let data = Symbol::variable(&engine, "data").unwrap();
    let fc = OperatorBuilder::new("FullyConnected")
        .param("num_hidden", 3)
        .input("data", &data)
        .create(&engine, "fc")
        .unwrap();
    let act = OperatorBuilder::new("Activation")
        .param("act_type", "tanh")
        .input("data", &fc)
        .create(&engine, "act")
        .unwrap();

    let json = act.to_json().unwrap();
    let loaded = Symbol::from_json(&engine, &json).unwrap();
    assert_eq!(loaded.list_arguments().unwrap(), act.list_arguments().unwrap());
    assert_eq!(loaded.list_outputs().unwrap(), act.list_outputs().unwrap());
    assert_eq!(loaded.to_json().unwrap(), json);
}

#[test]
fn test_malformed_json_is_error() {
    let engine = engine();
    let err = Symbol::from_json(&engine, "{not json").unwrap_err();
    assert_eq!(err.call(), Some("MXSymbolCreateFromJSON"));
}

// ============================================================================
// Shape inference
// ============================================================================

#[test]
fn test_infer_shape_from_one_operand() {
    let engine = engine();
    let x = Symbol::variable(&engine, "x").unwrap();
    let y = Symbol::variable(&engine, "y").unwrap();
    let z = (&x / &y).unwrap();

    let known = HashMap::from([("x".to_string(), shape(&[2, 3]))]);
    let inferred = z.infer_shape(&known).unwrap();
    assert!(inferred.complete);
    assert_eq!(inferred.arg_shapes, vec![shape(&[2, 3]), shape(&[2, 3])]);
    assert_eq!(inferred.out_shapes, vec![shape(&[2, 3])]);
}

#[test]
fn test_infer_shape_incomplete_without_inputs() {
    let engine = engine();
    let x = Symbol::variable(&engine, "x").unwrap();
    let y = Symbol::variable(&engine, "y").unwrap();
    let z = (&x + &y).unwrap();
    let inferred = z.infer_shape(&HashMap::new()).unwrap();
    assert!(!inferred.complete);
}

#[test]
fn test_infer_shape_conflict_is_error() {
    let engine = engine();
    let x = Symbol::variable(&engine, "x").unwrap();
    let y = Symbol::variable(&engine, "y").unwrap();
    let z = (&x + &y).unwrap();
    let known = HashMap::from([
        ("x".to_string(), shape(&[2, 3])),
        ("y".to_string(), shape(&[3, 2])),
    ]);
    let err = z.infer_shape(&known).unwrap_err();
    assert_eq!(err.call(), Some("MXSymbolInferShape"));
}

#[test]
fn test_infer_shape_overflow_leaves_engine_usable() {
    let engine = engine();
    let data = Symbol::variable(&engine, "data").unwrap();
    let fc = OperatorBuilder::new("FullyConnected")
        .param("num_hidden", 4)
        .input("data", &data)
        .create(&engine, "fc1")
        .unwrap();

    let huge = HashMap::from([("data".to_string(), shape(&[1, 65536, 65536]))]);
    let err = fc.infer_shape(&huge).unwrap_err();
    assert_eq!(err.call(), Some("MXSymbolInferShape"));

    let known = HashMap::from([("data".to_string(), shape(&[2, 3]))]);
    let shapes = fc.infer_shape(&known).unwrap();
    assert_eq!(shapes.arg_shapes[1], shape(&[4, 3]));
}

#[test]
fn test_batch_norm_aux_shapes() {
    let engine = engine();
    let data = Symbol::variable(&engine, "data").unwrap();
    let bn = OperatorBuilder::new("BatchNorm")
        .input("data", &data)
        .create(&engine, "bn")
        .unwrap();
    assert_eq!(
        bn.list_auxiliary_states().unwrap(),
        vec!["bn_moving_mean", "bn_moving_var"]
    );
    let known = HashMap::from([("data".to_string(), shape(&[4, 6]))]);
    let inferred = bn.infer_shape(&known).unwrap();
    assert_eq!(inferred.aux_shapes, vec![shape(&[6]), shape(&[6])]);
    assert_eq!(inferred.out_shapes, vec![shape(&[4, 6])]);
}

// ============================================================================
// Arrays
// ============================================================================

#[test]
fn test_ndarray_copy_and_metadata() {
    let engine = engine();
    let a = array(&engine, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
    assert_eq!(a.shape().unwrap(), shape(&[2, 3]));
    assert_eq!(a.context().unwrap(), Context::cpu());
    assert_eq!(a.size().unwrap(), 6);
    assert_eq!(a.to_vec().unwrap(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    assert!(a.sync_copy_from(&[1.0]).is_err());
}

#[test]
fn test_gpu_context_rejected() {
    let engine = engine();
    let err = NDArray::new(&engine, &shape(&[2]), Context::gpu(0), false).unwrap_err();
    assert_eq!(err.call(), Some("MXNDArrayCreate"));
}

#[test]
fn test_sample_gaussian_moments() {
    let engine = engine();
    let a = NDArray::new(&engine, &shape(&[100, 100]), Context::cpu(), false).unwrap();
    a.sample_gaussian(2.0, 0.5).unwrap();
    let values = a.to_vec().unwrap();
    let n = values.len() as f32;
    let mean = values.iter().sum::<f32>() / n;
    let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n;
    assert!((mean - 2.0).abs() < 0.05, "mean {mean}");
    assert!((var - 0.25).abs() < 0.05, "var {var}");
}

// ============================================================================
// Binding and execution
// ============================================================================

#[test]
fn test_sum_forward_backward() {
    let engine = engine();
    let x = Symbol::variable(&engine, "x").unwrap();
    let y = Symbol::variable(&engine, "y").unwrap();
    let z = (&x + &y).unwrap();

    let args = [
        array(&engine, &[1.0, 2.0, 3.0, 4.0], &[2, 2]),
        array(&engine, &[10.0, 20.0, 30.0, 40.0], &[2, 2]),
    ];
    let grads = [
        array(&engine, &[0.0; 4], &[2, 2]),
        array(&engine, &[0.0; 4], &[2, 2]),
    ];
    let exec = z
        .bind(
            Context::cpu(),
            &args,
            &grads,
            &[OpReqType::WriteTo, OpReqType::WriteTo],
            &[],
        )
        .unwrap();

    exec.forward(true).unwrap();
    assert_eq!(exec.outputs().len(), 1);
    assert_close(&exec.outputs()[0].to_vec().unwrap(), &[11.0, 22.0, 33.0, 44.0]);

    exec.backward(&[]).unwrap();
    assert_close(&grads[0].to_vec().unwrap(), &[1.0; 4]);
    assert_close(&grads[1].to_vec().unwrap(), &[1.0; 4]);
}

#[test]
fn test_outputs_observe_every_forward() {
    let engine = engine();
    let x = Symbol::variable(&engine, "x").unwrap();
    let y = Symbol::variable(&engine, "y").unwrap();
    let z = (&x * &y).unwrap();
    let args = [array(&engine, &[2.0], &[1]), array(&engine, &[3.0], &[1])];
    let grads = [array(&engine, &[0.0], &[1]), array(&engine, &[0.0], &[1])];
    let exec = z
        .bind(Context::cpu(), &args, &grads, &[OpReqType::NullOp; 2], &[])
        .unwrap();

    exec.forward(false).unwrap();
    assert_close(&exec.outputs()[0].to_vec().unwrap(), &[6.0]);
    args[0].sync_copy_from(&[5.0]).unwrap();
    exec.forward(false).unwrap();
    assert_close(&exec.outputs()[0].to_vec().unwrap(), &[15.0]);
}

#[test]
fn test_grad_requests() {
    let engine = engine();
    let x = Symbol::variable(&engine, "x").unwrap();
    let y = Symbol::variable(&engine, "y").unwrap();
    let z = (&x * &y).unwrap();
    let args = [array(&engine, &[2.0, 3.0], &[2]), array(&engine, &[5.0, 7.0], &[2])];
    let grads = [array(&engine, &[1.0, 1.0], &[2]), array(&engine, &[9.0, 9.0], &[2])];
    let exec = z
        .bind(
            Context::cpu(),
            &args,
            &grads,
            &[OpReqType::AddTo, OpReqType::NullOp],
            &[],
        )
        .unwrap();

    exec.forward(true).unwrap();
    exec.backward(&[]).unwrap();
    // d(xy)/dx = y, accumulated onto the existing ones
    assert_close(&grads[0].to_vec().unwrap(), &[6.0, 8.0]);
    assert_close(&grads[1].to_vec().unwrap(), &[9.0, 9.0]);

    exec.backward(&[]).unwrap();
    assert_close(&grads[0].to_vec().unwrap(), &[11.0, 15.0]);
}

#[test]
fn test_head_gradients_scale_backward() {
    let engine = engine();
    let x = Symbol::variable(&engine, "x").unwrap();
    let y = Symbol::variable(&engine, "y").unwrap();
    let z = (&x - &y).unwrap();
    let args = [array(&engine, &[1.0, 1.0], &[2]), array(&engine, &[1.0, 1.0], &[2])];
    let grads = [array(&engine, &[0.0, 0.0], &[2]), array(&engine, &[0.0, 0.0], &[2])];
    let exec = z
        .bind(Context::cpu(), &args, &grads, &[OpReqType::WriteTo; 2], &[])
        .unwrap();
    exec.forward(true).unwrap();
    let head = array(&engine, &[2.0, -3.0], &[2]);
    exec.backward(&[head]).unwrap();
    assert_close(&grads[0].to_vec().unwrap(), &[2.0, -3.0]);
    assert_close(&grads[1].to_vec().unwrap(), &[-2.0, 3.0]);
}

#[test]
fn test_backward_before_forward_is_error() {
    let engine = engine();
    let x = Symbol::variable(&engine, "x").unwrap();
    let y = Symbol::variable(&engine, "y").unwrap();
    let z = (&x + &y).unwrap();
    let args = [array(&engine, &[1.0], &[1]), array(&engine, &[1.0], &[1])];
    let grads = [array(&engine, &[0.0], &[1]), array(&engine, &[0.0], &[1])];
    let exec = z
        .bind(Context::cpu(), &args, &grads, &[OpReqType::WriteTo; 2], &[])
        .unwrap();
    let err = exec.backward(&[]).unwrap_err();
    assert_eq!(err.call(), Some("MXExecutorBackward"));
}

#[test]
fn test_bind_count_mismatch_is_engine_error() {
    let engine = engine();
    let x = Symbol::variable(&engine, "x").unwrap();
    let y = Symbol::variable(&engine, "y").unwrap();
    let z = (&x + &y).unwrap();
    let args = [array(&engine, &[1.0], &[1])];
    let err = z
        .bind(Context::cpu(), &args, &[], &[], &[])
        .unwrap_err();
    assert_eq!(err.call(), Some("MXExecutorBind"));
    assert_eq!(engine.live_handles().executors, 0);
}

#[test]
fn test_bind_shape_mismatch_is_engine_error() {
    let engine = engine();
    let x = Symbol::variable(&engine, "x").unwrap();
    let y = Symbol::variable(&engine, "y").unwrap();
    let z = (&x + &y).unwrap();
    let args = [array(&engine, &[1.0], &[1]), array(&engine, &[1.0, 2.0], &[2])];
    let grads = [array(&engine, &[0.0], &[1]), array(&engine, &[0.0, 0.0], &[2])];
    let err = z
        .bind(Context::cpu(), &args, &grads, &[OpReqType::WriteTo; 2], &[])
        .unwrap_err();
    assert_eq!(err.call(), Some("MXExecutorBind"));
}

#[test]
fn test_simple_bind_fills_missing_arrays() {
    let engine = engine();
    let data = Symbol::variable(&engine, "data").unwrap();
    let fc = OperatorBuilder::new("FullyConnected")
        .param("num_hidden", 4)
        .input("data", &data)
        .create(&engine, "fc1")
        .unwrap();

    let args_map = HashMap::from([(
        "data".to_string(),
        array(&engine, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]),
    )]);
    let exec = fc
        .simple_bind(Context::cpu(), &args_map, &HashMap::new(), &HashMap::new())
        .unwrap();

    assert_eq!(
        exec.grad_reqs(),
        &[OpReqType::NullOp, OpReqType::WriteTo, OpReqType::WriteTo]
    );
    let arg_dict = exec.arg_dict().unwrap();
    assert_eq!(arg_dict["fc1_weight"].shape().unwrap(), shape(&[4, 3]));
    assert_eq!(arg_dict["fc1_bias"].shape().unwrap(), shape(&[4]));
    assert!(arg_dict["fc1_weight"].to_vec().unwrap().iter().any(|v| *v != 0.0));

    exec.forward(true).unwrap();
    assert_eq!(exec.outputs()[0].shape().unwrap(), shape(&[2, 4]));
    exec.backward(&[]).unwrap();
    let grad_dict = exec.grad_dict().unwrap();
    // bias gradient of a sum over a batch of two
    assert_close(&grad_dict["fc1_bias"].to_vec().unwrap(), &[2.0; 4]);
}

#[test]
fn test_infer_args_map_reuses_given_arrays() {
    let engine = engine();
    let data = Symbol::variable(&engine, "data").unwrap();
    let fc = OperatorBuilder::new("FullyConnected")
        .param("num_hidden", 4)
        .input("data", &data)
        .create(&engine, "fc1")
        .unwrap();

    let given = array(&engine, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
    let known = HashMap::from([("data".to_string(), given.clone())]);
    let args = fc.infer_args_map(Context::cpu(), &known).unwrap();

    assert_eq!(args.len(), 3);
    assert_eq!(args["data"].handle(), given.handle());
    assert_eq!(args["fc1_weight"].shape().unwrap(), shape(&[4, 3]));
    assert_eq!(args["fc1_bias"].shape().unwrap(), shape(&[4]));
    assert_ne!(args["fc1_weight"].handle(), given.handle());
    assert_ne!(args["fc1_bias"].handle(), args["fc1_weight"].handle());
}

#[test]
fn test_simple_bind_allocates_aux_states() {
    let engine = engine();
    let data = Symbol::variable(&engine, "data").unwrap();
    let bn = OperatorBuilder::new("BatchNorm")
        .input("data", &data)
        .create(&engine, "bn")
        .unwrap();
    let args_map = HashMap::from([("data".to_string(), array(&engine, &[0.0; 6], &[2, 3]))]);
    let exec = bn
        .simple_bind(Context::cpu(), &args_map, &HashMap::new(), &HashMap::new())
        .unwrap();
    let aux = exec.aux_dict().unwrap();
    assert_eq!(aux.len(), 2);
    assert_eq!(aux["bn_moving_var"].shape().unwrap(), shape(&[3]));
    assert!(exec.forward(false).is_err());
}

#[test]
fn test_executor_release_on_drop_and_free() {
    let engine = engine();
    let x = Symbol::variable(&engine, "x").unwrap();
    let y = Symbol::variable(&engine, "y").unwrap();
    let z = (&x + &y).unwrap();
    let args = [array(&engine, &[1.0], &[1]), array(&engine, &[2.0], &[1])];
    let grads = [array(&engine, &[0.0], &[1]), array(&engine, &[0.0], &[1])];
    {
        let _exec = z
            .bind(Context::cpu(), &args, &grads, &[OpReqType::WriteTo; 2], &[])
            .unwrap();
        assert_eq!(engine.live_handles().executors, 1);
    }
    assert_eq!(engine.live_handles().executors, 0);

    let exec = z
        .bind(Context::cpu(), &args, &grads, &[OpReqType::WriteTo; 2], &[])
        .unwrap();
    exec.free().unwrap();
    assert_eq!(engine.live_handles().executors, 0);
}

#[test]
fn test_everything_released() {
    let engine = engine();
    {
        let x = Symbol::variable(&engine, "x").unwrap();
        let y = Symbol::variable(&engine, "y").unwrap();
        let z = (&x + &y).unwrap();
        let args_map = z
            .infer_args_map(
                Context::cpu(),
                &HashMap::from([("x".to_string(), array(&engine, &[1.0, 2.0], &[2]))]),
            )
            .unwrap();
        let exec = z
            .simple_bind(Context::cpu(), &args_map, &HashMap::new(), &HashMap::new())
            .unwrap();
        exec.forward(true).unwrap();
        exec.backward(&[]).unwrap();
    }
    assert_eq!(engine.live_handles(), mx_engine_ref::LiveHandles::default());
}

#[test]
fn test_engines_do_not_mix() {
    let a = engine();
    let b = engine();
    let x = Symbol::variable(&a, "x").unwrap();
    let y = Symbol::variable(&b, "y").unwrap();
    assert!(matches!((&x + &y).unwrap_err(), Error::EngineMismatch));
}

#[test]
fn test_backward_refuses_head_grads_from_another_engine() {
    let a = engine();
    let b = engine();
    let x = Symbol::variable(&a, "x").unwrap();
    let y = Symbol::variable(&a, "y").unwrap();
    let z = (&x + &y).unwrap();
    let args = HashMap::from([
        ("x".to_string(), array(&a, &[1.0], &[1])),
        ("y".to_string(), array(&a, &[2.0], &[1])),
    ]);
    let exec = z
        .simple_bind(Context::cpu(), &args, &HashMap::new(), &HashMap::new())
        .unwrap();
    exec.forward(true).unwrap();
    let grad_x = exec.grad_dict().unwrap()["x"].clone();
    let before = grad_x.to_vec().unwrap();

    let foreign = array(&b, &[5.0], &[1]);
    assert!(matches!(
        exec.backward(&[foreign]).unwrap_err(),
        Error::EngineMismatch
    ));
    assert_eq!(grad_x.to_vec().unwrap(), before);

    let own = array(&a, &[5.0], &[1]);
    exec.backward(&[own]).unwrap();
    assert_eq!(grad_x.to_vec().unwrap(), vec![5.0]);
}
