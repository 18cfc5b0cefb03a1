//! Activation operators.

use std::fmt;
use std::str::FromStr;

use mx_symbol::prelude::*;
use mx_symbol::OperatorBuilder;

/// Nonlinearity applied by the `Activation` operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActType {
    Relu,
    Sigmoid,
    Tanh,
}

impl ActType {
    /// The engine's `act_type` value.
    pub fn as_str(self) -> &'static str {
        match self {
            ActType::Relu => "relu",
            ActType::Sigmoid => "sigmoid",
            ActType::Tanh => "tanh",
        }
    }
}

impl fmt::Display for ActType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown activation '{0}': expected relu, sigmoid or tanh")]
pub struct ParseActTypeError(String);

impl FromStr for ActType {
    type Err = ParseActTypeError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "relu" => Ok(ActType::Relu),
            "sigmoid" => Ok(ActType::Sigmoid),
            "tanh" => Ok(ActType::Tanh),
            _ => Err(ParseActTypeError(s.to_string())),
        }
    }
}

/// `Activation` node named `name` applying `act` to `data`.
pub fn activation<E: Engine + ?Sized>(data: &Symbol<E>, name: &str, act: ActType) -> Result<Symbol<E>> {
    OperatorBuilder::new("Activation")
        .param("act_type", act)
        .input("data", data)
        .create(data.engine(), name)
}

/// ReLU activation: max(0, x)
pub fn relu<E: Engine + ?Sized>(data: &Symbol<E>, name: &str) -> Result<Symbol<E>> {
    activation(data, name, ActType::Relu)
}

/// Sigmoid activation: 1 / (1 + exp(-x))
pub fn sigmoid<E: Engine + ?Sized>(data: &Symbol<E>, name: &str) -> Result<Symbol<E>> {
    activation(data, name, ActType::Sigmoid)
}

/// Tanh activation: tanh(x)
pub fn tanh<E: Engine + ?Sized>(data: &Symbol<E>, name: &str) -> Result<Symbol<E>> {
    activation(data, name, ActType::Tanh)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use mx_engine_ref::RefEngine;

    use super::*;

    #[test]
    fn test_relu_forward() {
        let engine = Arc::new(RefEngine::new());
        let x = Symbol::variable(&engine, "x").unwrap();
        let y = relu(&x, "relu0").unwrap();
        assert_eq!(y.list_outputs().unwrap(), vec!["relu0_output"]);

        let input = NDArray::from_slice(
            &engine,
            &[-2.0, -1.0, 0.0, 1.0, 2.0],
            &Shape::new(vec![5]),
            Context::cpu(),
        )
        .unwrap();
        let args = HashMap::from([("x".to_string(), input)]);
        let exec = y
            .simple_bind(Context::cpu(), &args, &HashMap::new(), &HashMap::new())
            .unwrap();
        exec.forward(false).unwrap();
        assert_eq!(exec.outputs()[0].to_vec().unwrap(), vec![0.0, 0.0, 0.0, 1.0, 2.0]);
    }

    #[test]
    fn test_act_type_names() {
        assert_eq!(ActType::Relu.to_string(), "relu");
        assert_eq!(ActType::Sigmoid.as_str(), "sigmoid");
        assert_eq!(ActType::Tanh.as_str(), "tanh");
    }

    #[test]
    fn test_sigmoid_shape_follows_input() {
        let engine = Arc::new(RefEngine::new());
        let x = Symbol::variable(&engine, "x").unwrap();
        let y = sigmoid(&x, "s").unwrap();
        let shapes = y
            .infer_shape(&HashMap::from([("x".to_string(), Shape::new(vec![3, 4]))]))
            .unwrap();
        assert_eq!(shapes.out_shapes, vec![Shape::new(vec![3, 4])]);
    }

    #[test]
    fn test_parse_act_type() {
        assert_eq!("tanh".parse::<ActType>().unwrap(), ActType::Tanh);
        assert_eq!("ReLU".parse::<ActType>().unwrap(), ActType::Relu);
        assert!("softrelu".parse::<ActType>().is_err());
    }
}
