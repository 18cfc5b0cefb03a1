//! Operator registry: parameters, input names, shape rules and reference
//! kernels.
//!
//! Every operator produces exactly one output. Inputs are laid out as the
//! operator's arguments followed by its auxiliary states.

use std::collections::BTreeMap;

use mx_symbol::Shape;

/// Activation function selected by `act_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActType {
    Relu,
    Sigmoid,
    Tanh,
}

impl ActType {
    fn parse(value: &str) -> Result<Self, String> {
        match value {
            "relu" => Ok(ActType::Relu),
            "sigmoid" => Ok(ActType::Sigmoid),
            "tanh" => Ok(ActType::Tanh),
            other => Err(format!("unsupported act_type '{other}'")),
        }
    }
}

/// A parsed, validated operator.
#[derive(Debug, Clone, PartialEq)]
pub enum OpKind {
    /// Elementwise lhs + rhs.
    Plus,
    /// Elementwise lhs - rhs.
    Minus,
    /// Elementwise lhs * rhs.
    Mul,
    /// Elementwise lhs / rhs.
    Div,
    Activation(ActType),
    /// data (N, K...) x weight (num_hidden, K) + bias (num_hidden).
    FullyConnected { num_hidden: u32, no_bias: bool },
    /// Shape rules only; there is no reference kernel.
    BatchNorm { eps: f32, momentum: f32, fix_gamma: bool },
}

const BINARY_ARGS: &[&str] = &["lhs", "rhs"];
const DATA_ARGS: &[&str] = &["data"];
const FC_ARGS: &[&str] = &["data", "weight", "bias"];
const FC_NO_BIAS_ARGS: &[&str] = &["data", "weight"];
const BN_ARGS: &[&str] = &["data", "gamma", "beta"];
const BN_AUX: &[&str] = &["moving_mean", "moving_var"];

fn parse_bool(key: &str, value: &str) -> Result<bool, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" => Ok(true),
        "0" | "false" => Ok(false),
        _ => Err(format!("invalid boolean for {key}: '{value}'")),
    }
}

fn parse_f32(key: &str, value: &str) -> Result<f32, String> {
    value
        .trim()
        .parse::<f32>()
        .map_err(|_| format!("invalid number for {key}: '{value}'"))
}

fn reject_unknown(op_name: &str, attrs: &BTreeMap<String, String>, allowed: &[&str]) -> Result<(), String> {
    match attrs.keys().find(|k| !allowed.contains(&k.as_str())) {
        Some(key) => Err(format!("operator {op_name} has no parameter '{key}'")),
        None => Ok(()),
    }
}

impl OpKind {
    /// Parse an operator by registry name from its string parameters.
    pub fn parse(op_name: &str, attrs: &BTreeMap<String, String>) -> Result<Self, String> {
        match op_name {
            "_Plus" | "_Minus" | "_Mul" | "_Div" => {
                reject_unknown(op_name, attrs, &[])?;
                Ok(match op_name {
                    "_Plus" => OpKind::Plus,
                    "_Minus" => OpKind::Minus,
                    "_Mul" => OpKind::Mul,
                    _ => OpKind::Div,
                })
            }
            "Activation" => {
                reject_unknown(op_name, attrs, &["act_type"])?;
                let act = attrs
                    .get("act_type")
                    .ok_or_else(|| "Activation requires act_type".to_string())?;
                Ok(OpKind::Activation(ActType::parse(act)?))
            }
            "FullyConnected" => {
                reject_unknown(op_name, attrs, &["num_hidden", "no_bias"])?;
                let num_hidden = attrs
                    .get("num_hidden")
                    .ok_or_else(|| "FullyConnected requires num_hidden".to_string())?;
                let num_hidden = match num_hidden.trim().parse::<u32>() {
                    Ok(n) if n > 0 => n,
                    _ => return Err(format!("invalid num_hidden '{num_hidden}'")),
                };
                let no_bias = match attrs.get("no_bias") {
                    Some(v) => parse_bool("no_bias", v)?,
                    None => false,
                };
                Ok(OpKind::FullyConnected { num_hidden, no_bias })
            }
            "BatchNorm" => {
                reject_unknown(op_name, attrs, &["eps", "momentum", "fix_gamma"])?;
                let eps = match attrs.get("eps") {
                    Some(v) => parse_f32("eps", v)?,
                    None => 1e-3,
                };
                let momentum = match attrs.get("momentum") {
                    Some(v) => parse_f32("momentum", v)?,
                    None => 0.9,
                };
                let fix_gamma = match attrs.get("fix_gamma") {
                    Some(v) => parse_bool("fix_gamma", v)?,
                    None => true,
                };
                Ok(OpKind::BatchNorm {
                    eps,
                    momentum,
                    fix_gamma,
                })
            }
            other => Err(format!("operator '{other}' is not registered")),
        }
    }

    /// Argument input names, in input order.
    pub fn arguments(&self) -> &'static [&'static str] {
        match self {
            OpKind::Plus | OpKind::Minus | OpKind::Mul | OpKind::Div => BINARY_ARGS,
            OpKind::Activation(_) => DATA_ARGS,
            OpKind::FullyConnected { no_bias: false, .. } => FC_ARGS,
            OpKind::FullyConnected { no_bias: true, .. } => FC_NO_BIAS_ARGS,
            OpKind::BatchNorm { .. } => BN_ARGS,
        }
    }

    /// Auxiliary state input names, placed after the arguments.
    pub fn aux_states(&self) -> &'static [&'static str] {
        match self {
            OpKind::BatchNorm { .. } => BN_AUX,
            _ => &[],
        }
    }

    pub fn num_inputs(&self) -> usize {
        self.arguments().len() + self.aux_states().len()
    }

    /// Infer the output shape and fill in any input shapes this operator
    /// determines. Known shapes that disagree with the rule are an error.
    pub fn infer_shape(&self, inputs: &mut [Option<Shape>]) -> Result<Option<Shape>, String> {
        match self {
            OpKind::Plus | OpKind::Minus | OpKind::Mul | OpKind::Div => {
                let known = match (&inputs[0], &inputs[1]) {
                    (Some(a), Some(b)) if a != b => {
                        return Err(format!("operand shapes differ: {a} vs {b}"));
                    }
                    (Some(a), _) => a.clone(),
                    (_, Some(b)) => b.clone(),
                    (None, None) => return Ok(None),
                };
                inputs[0] = Some(known.clone());
                inputs[1] = Some(known.clone());
                Ok(Some(known))
            }
            OpKind::Activation(_) => Ok(inputs[0].clone()),
            OpKind::FullyConnected { num_hidden, no_bias } => {
                let Some(data) = inputs[0].clone() else {
                    return Ok(None);
                };
                if data.ndim() < 2 {
                    return Err(format!("FullyConnected expects data of rank >= 2, got {data}"));
                }
                let batch = data.dim(0);
                let features = data.dims()[1..]
                    .iter()
                    .try_fold(1u32, |acc, &d| acc.checked_mul(d))
                    .ok_or_else(|| format!("FullyConnected data {data} has too many features"))?;
                assign(&mut inputs[1], Shape::new(vec![*num_hidden, features]), "weight")?;
                if !no_bias {
                    assign(&mut inputs[2], Shape::new(vec![*num_hidden]), "bias")?;
                }
                Ok(Some(Shape::new(vec![batch, *num_hidden])))
            }
            OpKind::BatchNorm { .. } => {
                let Some(data) = inputs[0].clone() else {
                    return Ok(None);
                };
                if data.ndim() < 2 {
                    return Err(format!("BatchNorm expects data of rank >= 2, got {data}"));
                }
                let channels = Shape::new(vec![data.dim(1)]);
                for (slot, name) in inputs[1..].iter_mut().zip(["gamma", "beta", "moving_mean", "moving_var"]) {
                    assign(slot, channels.clone(), name)?;
                }
                Ok(Some(data))
            }
        }
    }

    /// Compute the output from input values and shapes.
    pub fn forward(&self, inputs: &[&[f32]], shapes: &[Shape]) -> Result<Vec<f32>, String> {
        match self {
            OpKind::Plus => Ok(zip_map(inputs[0], inputs[1], |a, b| a + b)),
            OpKind::Minus => Ok(zip_map(inputs[0], inputs[1], |a, b| a - b)),
            OpKind::Mul => Ok(zip_map(inputs[0], inputs[1], |a, b| a * b)),
            OpKind::Div => Ok(zip_map(inputs[0], inputs[1], |a, b| a / b)),
            OpKind::Activation(act) => Ok(inputs[0].iter().map(|&x| activate(*act, x)).collect()),
            OpKind::FullyConnected { num_hidden, no_bias } => {
                let (n, k) = flat_dims(&shapes[0])?;
                let h = *num_hidden as usize;
                let (x, w) = (inputs[0], inputs[1]);
                let mut out = vec![0.0f32; n * h];
                for row in 0..n {
                    for col in 0..h {
                        let mut acc = if *no_bias { 0.0 } else { inputs[2][col] };
                        for i in 0..k {
                            acc += x[row * k + i] * w[col * k + i];
                        }
                        out[row * h + col] = acc;
                    }
                }
                Ok(out)
            }
            OpKind::BatchNorm { .. } => Err("operator BatchNorm has no reference kernel".to_string()),
        }
    }

    /// Gradients with respect to each input given the output gradient.
    ///
    /// Returns one entry per input; `None` for inputs that receive no
    /// gradient (auxiliary states).
    pub fn backward(
        &self,
        out_grad: &[f32],
        inputs: &[&[f32]],
        output: &[f32],
        shapes: &[Shape],
    ) -> Result<Vec<Option<Vec<f32>>>, String> {
        match self {
            OpKind::Plus => {
                // z = a + b
                // dz/da = 1, dz/db = 1
                Ok(vec![Some(out_grad.to_vec()), Some(out_grad.to_vec())])
            }
            OpKind::Minus => {
                // z = a - b
                // dz/da = 1, dz/db = -1
                Ok(vec![
                    Some(out_grad.to_vec()),
                    Some(out_grad.iter().map(|g| -g).collect()),
                ])
            }
            OpKind::Mul => {
                // z = a * b
                // dz/da = b, dz/db = a
                let (a, b) = (inputs[0], inputs[1]);
                Ok(vec![
                    Some(zip_map(out_grad, b, |g, b| g * b)),
                    Some(zip_map(out_grad, a, |g, a| g * a)),
                ])
            }
            OpKind::Div => {
                // z = a / b
                // dz/da = 1/b, dz/db = -a/b^2
                let (a, b) = (inputs[0], inputs[1]);
                let da = zip_map(out_grad, b, |g, b| g / b);
                let db = out_grad
                    .iter()
                    .zip(a.iter().zip(b))
                    .map(|(g, (a, b))| -g * a / (b * b))
                    .collect();
                Ok(vec![Some(da), Some(db)])
            }
            OpKind::Activation(act) => {
                let dx = out_grad
                    .iter()
                    .zip(inputs[0].iter().zip(output))
                    .map(|(g, (&x, &y))| g * activation_grad(*act, x, y))
                    .collect();
                Ok(vec![Some(dx)])
            }
            OpKind::FullyConnected { num_hidden, no_bias } => {
                // y = x W^T + b
                // dx = dy W, dW = dy^T x, db = sum_rows(dy)
                let (n, k) = flat_dims(&shapes[0])?;
                let h = *num_hidden as usize;
                let (x, w) = (inputs[0], inputs[1]);
                let mut dx = vec![0.0f32; n * k];
                let mut dw = vec![0.0f32; h * k];
                let mut db = vec![0.0f32; h];
                for row in 0..n {
                    for col in 0..h {
                        let g = out_grad[row * h + col];
                        db[col] += g;
                        for i in 0..k {
                            dx[row * k + i] += g * w[col * k + i];
                            dw[col * k + i] += g * x[row * k + i];
                        }
                    }
                }
                let mut grads = vec![Some(dx), Some(dw)];
                if !no_bias {
                    grads.push(Some(db));
                }
                Ok(grads)
            }
            OpKind::BatchNorm { .. } => Err("operator BatchNorm has no reference kernel".to_string()),
        }
    }
}

fn assign(slot: &mut Option<Shape>, inferred: Shape, name: &str) -> Result<(), String> {
    match slot {
        Some(existing) if *existing != inferred => Err(format!(
            "shape mismatch for {name}: inferred {inferred}, provided {existing}"
        )),
        _ => {
            *slot = Some(inferred);
            Ok(())
        }
    }
}

fn zip_map(a: &[f32], b: &[f32], f: impl Fn(f32, f32) -> f32) -> Vec<f32> {
    a.iter().zip(b).map(|(&a, &b)| f(a, b)).collect()
}

/// Rows and flattened features of a rank >= 2 shape.
fn flat_dims(shape: &Shape) -> Result<(usize, usize), String> {
    let n = shape.dim(0) as usize;
    let k = shape.dims()[1..]
        .iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d as usize))
        .ok_or_else(|| format!("shape {shape} has too many elements"))?;
    n.checked_mul(k)
        .ok_or_else(|| format!("shape {shape} has too many elements"))?;
    Ok((n, k))
}

fn activate(act: ActType, x: f32) -> f32 {
    match act {
        ActType::Relu => x.max(0.0),
        ActType::Sigmoid => 1.0 / (1.0 + (-x).exp()),
        ActType::Tanh => x.tanh(),
    }
}

/// d(act)/dx, using the forward output `y` where it is cheaper.
fn activation_grad(act: ActType, x: f32, y: f32) -> f32 {
    match act {
        ActType::Relu => {
            if x > 0.0 {
                1.0
            } else {
                0.0
            }
        }
        ActType::Sigmoid => y * (1.0 - y),
        ActType::Tanh => 1.0 - y * y,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_registry() {
        assert_eq!(OpKind::parse("_Plus", &attrs(&[])).unwrap(), OpKind::Plus);
        assert_eq!(
            OpKind::parse("Activation", &attrs(&[("act_type", "tanh")])).unwrap(),
            OpKind::Activation(ActType::Tanh)
        );
        assert_eq!(
            OpKind::parse("FullyConnected", &attrs(&[("num_hidden", "8"), ("no_bias", "True")]))
                .unwrap(),
            OpKind::FullyConnected {
                num_hidden: 8,
                no_bias: true
            }
        );
        assert!(OpKind::parse("Convolution", &attrs(&[])).is_err());
        assert!(OpKind::parse("Activation", &attrs(&[])).is_err());
        assert!(OpKind::parse("_Plus", &attrs(&[("scalar", "1")])).is_err());
        assert!(OpKind::parse("FullyConnected", &attrs(&[("num_hidden", "0")])).is_err());
    }

    #[test]
    fn test_binary_shape_fills_unknown_operand() {
        let mut inputs = vec![None, Some(Shape::new(vec![2, 3]))];
        let out = OpKind::Plus.infer_shape(&mut inputs).unwrap();
        assert_eq!(out, Some(Shape::new(vec![2, 3])));
        assert_eq!(inputs[0], Some(Shape::new(vec![2, 3])));
    }

    #[test]
    fn test_binary_shape_mismatch() {
        let mut inputs = vec![Some(Shape::new(vec![2])), Some(Shape::new(vec![3]))];
        assert!(OpKind::Mul.infer_shape(&mut inputs).is_err());
    }

    #[test]
    fn test_fully_connected_shapes() {
        let op = OpKind::FullyConnected {
            num_hidden: 10,
            no_bias: false,
        };
        let mut inputs = vec![Some(Shape::new(vec![4, 3, 2])), None, None];
        let out = op.infer_shape(&mut inputs).unwrap();
        assert_eq!(out, Some(Shape::new(vec![4, 10])));
        assert_eq!(inputs[1], Some(Shape::new(vec![10, 6])));
        assert_eq!(inputs[2], Some(Shape::new(vec![10])));
    }

    #[test]
    fn test_fully_connected_feature_overflow_is_error() {
        let op = OpKind::FullyConnected {
            num_hidden: 2,
            no_bias: false,
        };
        let mut inputs = vec![Some(Shape::new(vec![1, 65536, 65536])), None, None];
        let err = op.infer_shape(&mut inputs).unwrap_err();
        assert!(err.contains("too many features"), "{err}");
        assert_eq!(inputs[1], None);

        let huge = Shape::new(vec![u32::MAX, u32::MAX, u32::MAX]);
        assert!(flat_dims(&huge).is_err());
        assert_eq!(flat_dims(&Shape::new(vec![4, 3, 2])), Ok((4, 6)));
    }

    #[test]
    fn test_batch_norm_shapes() {
        let op = OpKind::parse("BatchNorm", &attrs(&[])).unwrap();
        assert_eq!(op.aux_states(), &["moving_mean", "moving_var"]);
        let mut inputs = vec![Some(Shape::new(vec![2, 5, 7])), None, None, None, None];
        let out = op.infer_shape(&mut inputs).unwrap();
        assert_eq!(out, Some(Shape::new(vec![2, 5, 7])));
        for slot in &inputs[1..] {
            assert_eq!(slot, &Some(Shape::new(vec![5])));
        }
    }

    #[test]
    fn test_fully_connected_forward() {
        let op = OpKind::FullyConnected {
            num_hidden: 2,
            no_bias: false,
        };
        // x: 1x3, W: 2x3, b: 2
        let x = [1.0, 2.0, 3.0];
        let w = [1.0, 0.0, 0.0, 0.0, 1.0, 1.0];
        let b = [0.5, -1.0];
        let shapes = [Shape::new(vec![1, 3]), Shape::new(vec![2, 3]), Shape::new(vec![2])];
        let out = op.forward(&[&x, &w, &b], &shapes).unwrap();
        assert_eq!(out, vec![1.5, 4.0]);
    }

    #[test]
    fn test_activation_forward() {
        let out = OpKind::Activation(ActType::Relu)
            .forward(&[&[-1.0, 0.0, 2.0]], &[Shape::new(vec![3])])
            .unwrap();
        assert_eq!(out, vec![0.0, 0.0, 2.0]);
        let out = OpKind::Activation(ActType::Sigmoid)
            .forward(&[&[0.0]], &[Shape::new(vec![1])])
            .unwrap();
        assert!((out[0] - 0.5).abs() < 1e-6);
    }
}
