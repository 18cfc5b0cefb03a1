//! Bound executors: forward evaluation and reverse-mode gradients over a
//! composed graph.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use mx_symbol::{OpReqType, Shape};

use crate::graph::{Entry, Graph, Node, NodeId};

/// Storage shared between arrays and the executors bound to them.
pub type Buffer = Arc<Mutex<Vec<f32>>>;

pub fn lock(buffer: &Buffer) -> Result<MutexGuard<'_, Vec<f32>>, String> {
    buffer
        .lock()
        .map_err(|_| "array storage lock poisoned".to_string())
}

/// An array as the executor sees it.
#[derive(Clone)]
pub struct Bound {
    pub shape: Shape,
    pub data: Buffer,
}

pub struct BoundExecutor {
    outputs: Vec<Entry>,
    order: Vec<Arc<Node>>,
    shapes: HashMap<NodeId, Shape>,
    arg_slots: HashMap<NodeId, usize>,
    aux_slots: HashMap<NodeId, usize>,
    args: Vec<Bound>,
    grads: Vec<Option<Bound>>,
    reqs: Vec<OpReqType>,
    aux: Vec<Bound>,
    out_buffers: Vec<Bound>,
    /// Node values from the most recent forward pass.
    values: Option<HashMap<NodeId, Vec<f32>>>,
}

impl BoundExecutor {
    /// Validate arrays against the graph and build an executor over them.
    ///
    /// `grads[i]` may be `None` only when `reqs[i]` is `NullOp`.
    pub fn bind(
        graph: &Graph,
        args: Vec<Bound>,
        grads: Vec<Option<Bound>>,
        reqs: Vec<OpReqType>,
        aux: Vec<Bound>,
    ) -> Result<Self, String> {
        let layout = graph.layout()?;
        if args.len() != layout.arguments.len() {
            return Err(format!(
                "expected {} argument arrays, got {}",
                layout.arguments.len(),
                args.len()
            ));
        }
        if grads.len() != args.len() || reqs.len() != args.len() {
            return Err(format!(
                "expected {} gradient arrays and requests, got {} and {}",
                args.len(),
                grads.len(),
                reqs.len()
            ));
        }
        if aux.len() != layout.aux_states.len() {
            return Err(format!(
                "expected {} auxiliary arrays, got {}",
                layout.aux_states.len(),
                aux.len()
            ));
        }

        let known: Vec<(&str, &Shape)> = layout
            .arguments
            .iter()
            .zip(&args)
            .map(|(node, array)| (node.name.as_str(), &array.shape))
            .collect();
        let shapes = graph.node_shapes(&known)?;

        for (node, array) in layout.arguments.iter().zip(&args) {
            check_shape(&node.name, &shapes, node.id, &array.shape)?;
        }
        for (i, (node, req)) in layout.arguments.iter().zip(&reqs).enumerate() {
            match &grads[i] {
                Some(grad) if grad.shape != args[i].shape => {
                    return Err(format!(
                        "gradient for {} has shape {}, expected {}",
                        node.name, grad.shape, args[i].shape
                    ));
                }
                None if *req != OpReqType::NullOp => {
                    return Err(format!("{} requests a gradient but has no store", node.name));
                }
                _ => {}
            }
        }
        for (node, array) in layout.aux_states.iter().zip(&aux) {
            check_shape(&node.name, &shapes, node.id, &array.shape)?;
        }

        let outputs = match graph {
            Graph::Composed(outputs) => outputs.clone(),
            Graph::Atomic(_) => return Err("cannot bind an uncomposed operator".to_string()),
        };
        let mut out_buffers = Vec::with_capacity(outputs.len());
        for entry in &outputs {
            let shape = shapes
                .get(&entry.node.id)
                .cloned()
                .ok_or_else(|| format!("cannot infer the shape of {}", entry.node.name))?;
            out_buffers.push(Bound {
                data: Arc::new(Mutex::new(vec![0.0; shape.numel()])),
                shape,
            });
        }

        Ok(BoundExecutor {
            arg_slots: slots(&layout.arguments),
            aux_slots: slots(&layout.aux_states),
            outputs,
            order: layout.order,
            shapes,
            args,
            grads,
            reqs,
            aux,
            out_buffers,
            values: None,
        })
    }

    pub fn outputs(&self) -> &[Bound] {
        &self.out_buffers
    }

    pub fn forward(&mut self, _is_train: bool) -> Result<(), String> {
        let mut values: HashMap<NodeId, Vec<f32>> = HashMap::new();

        for node in &self.order {
            let value = match &node.op {
                None => {
                    let bound = match (self.arg_slots.get(&node.id), self.aux_slots.get(&node.id)) {
                        (Some(&i), _) => &self.args[i],
                        (None, Some(&i)) => &self.aux[i],
                        (None, None) => return Err(format!("variable {} is not bound", node.name)),
                    };
                    lock(&bound.data)?.clone()
                }
                Some(op) => {
                    let inputs: Vec<&[f32]> = node
                        .inputs
                        .iter()
                        .map(|e| values[&e.node.id].as_slice())
                        .collect();
                    let shapes = self.input_shapes(node);
                    op.kind
                        .forward(&inputs, &shapes)
                        .map_err(|e| format!("{}: {e}", node.name))?
                }
            };
            values.insert(node.id, value);
        }

        for (entry, out) in self.outputs.iter().zip(&self.out_buffers) {
            lock(&out.data)?.copy_from_slice(&values[&entry.node.id]);
        }
        self.values = Some(values);
        Ok(())
    }

    /// Propagate `head_grads` (one per output, or unit gradients when empty)
    /// back to the arguments according to their gradient requests.
    pub fn backward(&mut self, head_grads: &[Bound]) -> Result<(), String> {
        let values = self
            .values
            .as_ref()
            .ok_or_else(|| "backward called before forward".to_string())?;
        if !head_grads.is_empty() && head_grads.len() != self.outputs.len() {
            return Err(format!(
                "expected {} head gradients, got {}",
                self.outputs.len(),
                head_grads.len()
            ));
        }

        let mut adjoints: HashMap<NodeId, Vec<f32>> = HashMap::new();
        for (i, entry) in self.outputs.iter().enumerate() {
            let numel = self.out_buffers[i].shape.numel();
            let seed = match head_grads.get(i) {
                Some(head) => {
                    if head.shape != self.out_buffers[i].shape {
                        return Err(format!(
                            "head gradient {i} has shape {}, expected {}",
                            head.shape, self.out_buffers[i].shape
                        ));
                    }
                    lock(&head.data)?.clone()
                }
                None => vec![1.0; numel],
            };
            accumulate(&mut adjoints, entry.node.id, &seed);
        }

        for node in self.order.iter().rev() {
            let Some(op) = &node.op else {
                continue;
            };
            let Some(upstream) = adjoints.get(&node.id).cloned() else {
                continue;
            };
            let inputs: Vec<&[f32]> = node
                .inputs
                .iter()
                .map(|e| values[&e.node.id].as_slice())
                .collect();
            let shapes = self.input_shapes(node);
            let local = op
                .kind
                .backward(&upstream, &inputs, &values[&node.id], &shapes)
                .map_err(|e| format!("{}: {e}", node.name))?;
            for (entry, grad) in node.inputs.iter().zip(local) {
                if let Some(grad) = grad {
                    accumulate(&mut adjoints, entry.node.id, &grad);
                }
            }
        }

        for node in &self.order {
            let Some(&slot) = self.arg_slots.get(&node.id) else {
                continue;
            };
            let Some(store) = &self.grads[slot] else {
                continue;
            };
            let mut target = lock(&store.data)?;
            match (self.reqs[slot], adjoints.get(&node.id)) {
                (OpReqType::NullOp, _) => {}
                (OpReqType::WriteTo, Some(grad)) => target.copy_from_slice(grad),
                (OpReqType::WriteTo, None) => target.iter_mut().for_each(|v| *v = 0.0),
                (OpReqType::AddTo, Some(grad)) => {
                    for (t, g) in target.iter_mut().zip(grad) {
                        *t += g;
                    }
                }
                (OpReqType::AddTo, None) => {}
            }
        }
        Ok(())
    }

    fn input_shapes(&self, node: &Node) -> Vec<Shape> {
        node.inputs
            .iter()
            .map(|e| self.shapes.get(&e.node.id).cloned().unwrap_or_default())
            .collect()
    }
}

fn slots(nodes: &[Arc<Node>]) -> HashMap<NodeId, usize> {
    nodes.iter().enumerate().map(|(i, n)| (n.id, i)).collect()
}

fn accumulate(adjoints: &mut HashMap<NodeId, Vec<f32>>, id: NodeId, grad: &[f32]) {
    adjoints
        .entry(id)
        .and_modify(|existing| {
            for (e, g) in existing.iter_mut().zip(grad) {
                *e += g;
            }
        })
        .or_insert_with(|| grad.to_vec());
}

fn check_shape(
    name: &str,
    shapes: &HashMap<NodeId, Shape>,
    id: NodeId,
    actual: &Shape,
) -> Result<(), String> {
    match shapes.get(&id) {
        Some(expected) if expected != actual => Err(format!(
            "array for {name} has shape {actual}, expected {expected}"
        )),
        Some(_) => Ok(()),
        None => Err(format!("cannot infer the shape of {name}")),
    }
}
