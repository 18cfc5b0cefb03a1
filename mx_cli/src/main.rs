//! CLI demo for the symbolic-graph bindings.
//!
//! Builds graphs through an engine, lists their names, infers shapes, binds
//! executors and runs them forward and backward.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use clap::{Args, Parser, Subcommand, ValueEnum, ValueHint};
use tracing::info;
use tracing_subscriber::EnvFilter;

use mx_engine_native::NativeEngine;
use mx_engine_ref::RefEngine;
use mx_nn::{batch_norm, mlp, ActType, BatchNormParams, Sgd};
use mx_symbol::{Context, Engine, Executor, InferredShapes, NDArray, OpReqType, Shape, Symbol};

#[derive(Parser)]
#[command(author, version, about = "Build, bind and run symbolic graphs")]
struct Cli {
    /// Engine implementation to drive
    #[arg(long, value_enum, global = true, default_value_t = EngineKind::Reference)]
    engine: EngineKind,

    /// Native engine library; the platform default name is used when unset
    #[arg(long, global = true, env = "MXNET_LIBRARY_PATH", value_hint = ValueHint::FilePath)]
    library: Option<PathBuf>,

    /// Seed for the reference engine's random initialisation
    #[arg(long, global = true)]
    seed: Option<u64>,

    /// Device context, e.g. cpu or gpu(0)
    #[arg(long, global = true, default_value = "cpu")]
    ctx: Context,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum EngineKind {
    /// In-process reference engine
    Reference,
    /// Engine shared library loaded at run time
    Native,
}

#[derive(Subcommand)]
enum Command {
    /// Bind z = x + y, run forward and backward, print the results
    Demo(DemoArgs),

    /// Build an MLP and print its names and inferred shapes
    Inspect(InspectArgs),

    /// Fit XOR with an MLP and SGD
    Train(TrainArgs),
}

#[derive(Args)]
struct DemoArgs {
    /// Shape of x and y, e.g. 2,3
    #[arg(long, default_value = "2,3")]
    shape: Shape,

    /// Gradient request for x and y: null, write or add
    #[arg(long, default_value = "write")]
    grad_req: OpReqType,
}

#[derive(Args)]
struct InspectArgs {
    /// Shape of the data input, e.g. 4,2
    #[arg(long, default_value = "4,2")]
    shape: Shape,

    /// Units per fully connected layer
    #[arg(long, value_delimiter = ',', default_value = "8,1")]
    hidden: Vec<u32>,

    /// Activation between layers: relu, sigmoid or tanh
    #[arg(long, default_value = "relu")]
    act: ActType,

    /// Normalise the data with a BatchNorm node first
    #[arg(long)]
    batch_norm: bool,

    /// Also print the graph JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct TrainArgs {
    /// Hidden units
    #[arg(long, default_value_t = 16)]
    hidden: u32,

    #[arg(long, default_value_t = 2000)]
    epochs: usize,

    #[arg(long, default_value_t = 0.05)]
    learning_rate: f32,

    #[arg(long, default_value_t = 0.9)]
    momentum: f32,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

fn open_engine(cli: &Cli) -> Result<Arc<dyn Engine>> {
    if cli.engine == EngineKind::Reference {
        let engine = match cli.seed {
            Some(seed) => RefEngine::with_seed(seed),
            None => RefEngine::new(),
        };
        return Ok(Arc::new(engine));
    }
    let native = match &cli.library {
        Some(path) => NativeEngine::load(path),
        None => NativeEngine::from_env(),
    }
    .context("cannot open the native engine")?;
    info!(path = %native.path().display(), "using native engine");
    Ok(Arc::new(native))
}

fn print_shapes(names: &[String], shapes: &[Shape]) {
    for (name, shape) in names.iter().zip(shapes) {
        println!("  {name:<24} {shape}");
    }
}

fn print_inferred(symbol: &Symbol, shapes: &InferredShapes) -> Result<()> {
    if !shapes.complete {
        println!("Shape inference incomplete");
    }
    println!("Arguments:");
    print_shapes(&symbol.list_arguments()?, &shapes.arg_shapes);
    println!("Outputs:");
    print_shapes(&symbol.list_outputs()?, &shapes.out_shapes);
    let aux = symbol.list_auxiliary_states()?;
    if !aux.is_empty() {
        println!("Auxiliary states:");
        print_shapes(&aux, &shapes.aux_shapes);
    }
    Ok(())
}

fn sorted(arrays: HashMap<String, NDArray>) -> Vec<(String, NDArray)> {
    let mut arrays: Vec<_> = arrays.into_iter().collect();
    arrays.sort_by(|a, b| a.0.cmp(&b.0));
    arrays
}

fn run_demo(engine: &Arc<dyn Engine>, ctx: Context, args: &DemoArgs) -> Result<()> {
    println!("=== z = x + y on the {} engine ===\n", engine.name());

    let x = Symbol::variable(engine, "x")?;
    let y = Symbol::variable(engine, "y")?;
    let z = (&x + &y)?;
    println!("Arguments: {:?}", z.list_arguments()?);
    println!("Outputs:   {:?}\n", z.list_outputs()?);

    let known = HashMap::from([
        ("x".to_string(), args.shape.clone()),
        ("y".to_string(), args.shape.clone()),
    ]);
    print_inferred(&z, &z.infer_shape(&known)?)?;

    let n = args.shape.numel();
    let xs: Vec<f32> = (0..n).map(|i| i as f32).collect();
    let ys: Vec<f32> = (0..n).map(|i| 0.5 * i as f32).collect();
    let arrays = HashMap::from([
        ("x".to_string(), NDArray::from_slice(engine, &xs, &args.shape, ctx)?),
        ("y".to_string(), NDArray::from_slice(engine, &ys, &args.shape, ctx)?),
    ]);
    let reqs = HashMap::from([
        ("x".to_string(), args.grad_req),
        ("y".to_string(), args.grad_req),
    ]);
    let exec = z.simple_bind(ctx, &arrays, &HashMap::new(), &reqs)?;

    exec.forward(true)?;
    let heads = unit_head_grads(engine, &exec, ctx)?;
    exec.backward(&heads)?;

    println!("\nForward:");
    println!("  x = {xs:?}");
    println!("  y = {ys:?}");
    for (name, out) in z.list_outputs()?.iter().zip(exec.outputs()) {
        println!("  {name} = {:?}", out.to_vec()?);
    }
    println!("\nGradients ({:?}):", args.grad_req);
    for (name, grad) in sorted(exec.grad_dict()?) {
        println!("  d{name} = {:?}", grad.to_vec()?);
    }

    exec.free()?;
    Ok(())
}

/// A gradient of ones for every output.
fn unit_head_grads(engine: &Arc<dyn Engine>, exec: &Executor, ctx: Context) -> Result<Vec<NDArray>> {
    let mut heads = Vec::with_capacity(exec.outputs().len());
    for out in exec.outputs() {
        let shape = out.shape()?;
        heads.push(NDArray::from_slice(engine, &vec![1.0; shape.numel()], &shape, ctx)?);
    }
    Ok(heads)
}

fn run_inspect(engine: &Arc<dyn Engine>, args: &InspectArgs) -> Result<()> {
    if args.hidden.is_empty() {
        bail!("--hidden needs at least one layer");
    }
    let data = Symbol::variable(engine, "data")?;
    let input = if args.batch_norm {
        batch_norm(&data, "bn", BatchNormParams::default())?
    } else {
        data
    };
    let net = mlp(&input, "", &args.hidden, args.act)?;

    println!("=== MLP {:?} ({}) ===\n", args.hidden, args.act);
    let known = HashMap::from([("data".to_string(), args.shape.clone())]);
    print_inferred(&net, &net.infer_shape(&known)?)?;

    if args.json {
        println!("\n{}", net.to_json()?);
    }
    Ok(())
}

fn run_train(engine: &Arc<dyn Engine>, ctx: Context, args: &TrainArgs) -> Result<()> {
    // XOR dataset
    let inputs = [0.0, 0.0, 0.0, 1.0, 1.0, 0.0, 1.0, 1.0];
    let targets = [0.0, 1.0, 1.0, 0.0];

    let data = Symbol::variable(engine, "data")?;
    let net = mlp(&data, "", &[args.hidden, 1], ActType::Tanh)?;

    let x = NDArray::from_slice(engine, &inputs, &Shape::new(vec![4, 2]), ctx)?;
    let arrays = HashMap::from([("data".to_string(), x)]);
    let exec = net.simple_bind(ctx, &arrays, &HashMap::new(), &HashMap::new())?;
    let out_shape = exec.outputs()[0].shape()?;
    let mut opt = Sgd::with_momentum(args.learning_rate, args.momentum);

    println!("=== Training XOR ({} hidden units) ===\n", args.hidden);
    let log_every = (args.epochs / 10).max(1);
    for epoch in 0..args.epochs {
        exec.forward(true)?;
        let pred = exec.outputs()[0].to_vec()?;

        let loss = pred.iter().zip(&targets).map(|(p, t)| (p - t) * (p - t)).sum::<f32>() / 4.0;
        // d(mean squared error)/d(pred)
        let grad: Vec<f32> = pred.iter().zip(&targets).map(|(p, t)| (p - t) / 2.0).collect();
        let head = NDArray::from_slice(engine, &grad, &out_shape, ctx)?;

        exec.backward(&[head])?;
        opt.update(&exec)?;

        if epoch % log_every == 0 || epoch + 1 == args.epochs {
            println!("Epoch {epoch:5}: loss = {loss:.6}");
        }
    }

    exec.forward(false)?;
    let pred = exec.outputs()[0].to_vec()?;
    println!("\nPredictions:");
    for (i, (p, t)) in pred.iter().zip(&targets).enumerate() {
        println!("  {} XOR {} = {p:.3} (expected {t})", inputs[2 * i], inputs[2 * i + 1]);
    }
    Ok(())
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let engine = open_engine(&cli)?;

    match &cli.command {
        Command::Demo(args) => run_demo(&engine, cli.ctx, args),
        Command::Inspect(args) => run_inspect(&engine, args),
        Command::Train(args) => run_train(&engine, cli.ctx, args),
    }
}
