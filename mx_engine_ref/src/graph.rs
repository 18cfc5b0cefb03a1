//! Symbolic graph held by the reference engine.
//!
//! Nodes are immutable once built and shared through `Arc`, so copying a
//! symbol or composing it into a larger graph never mutates existing nodes.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use mx_symbol::{InferredShapes, Shape};
use serde::{Deserialize, Serialize};

use crate::ops::OpKind;

static NODE_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_node_id() -> NodeId {
    NodeId(NODE_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
}

/// Unique identifier for a node across every graph in the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u64);

/// An operator together with the string parameters it was created from.
#[derive(Debug, Clone)]
pub struct Operator {
    pub op_name: String,
    pub kind: OpKind,
    pub attrs: BTreeMap<String, String>,
}

impl Operator {
    pub fn new(op_name: &str, attrs: BTreeMap<String, String>) -> Result<Self, String> {
        let kind = OpKind::parse(op_name, &attrs)?;
        Ok(Operator {
            op_name: op_name.to_string(),
            kind,
            attrs,
        })
    }
}

#[derive(Debug)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    /// `None` for variables.
    pub op: Option<Operator>,
    /// Arguments followed by auxiliary states.
    pub inputs: Vec<Entry>,
}

impl Node {
    pub fn is_variable(&self) -> bool {
        self.op.is_none()
    }

    fn variable(name: String) -> Arc<Node> {
        Arc::new(Node {
            id: next_node_id(),
            name,
            op: None,
            inputs: Vec::new(),
        })
    }

    fn output_name(&self) -> String {
        if self.is_variable() {
            self.name.clone()
        } else {
            format!("{}_output", self.name)
        }
    }
}

/// One output of a node.
#[derive(Debug, Clone)]
pub struct Entry {
    pub node: Arc<Node>,
    pub index: u32,
}

impl Entry {
    fn of(node: Arc<Node>) -> Self {
        Entry { node, index: 0 }
    }
}

/// What a symbol handle refers to.
#[derive(Debug, Clone)]
pub enum Graph {
    /// An operator that has not been given its inputs yet.
    Atomic(Operator),
    /// A composed graph with its output entries.
    Composed(Vec<Entry>),
}

/// Nodes of a composed graph in dependency order, with its variables split
/// into arguments and auxiliary states.
pub struct Layout {
    pub order: Vec<Arc<Node>>,
    pub arguments: Vec<Arc<Node>>,
    pub aux_states: Vec<Arc<Node>>,
}

impl Graph {
    pub fn variable(name: &str) -> Graph {
        Graph::Composed(vec![Entry::of(Node::variable(name.to_string()))])
    }

    /// Attach inputs to an atomic operator, turning it into a graph.
    ///
    /// Inputs are positional when `keys` is empty, otherwise matched by
    /// argument name. Arguments left unset become variables named
    /// `{name}_{argument}`, as do auxiliary states.
    pub fn compose(&mut self, name: &str, keys: &[&str], inputs: Vec<Entry>) -> Result<(), String> {
        let Graph::Atomic(op) = self else {
            return Err("only an uncomposed operator can be composed".to_string());
        };
        let arg_names = op.kind.arguments();

        let mut slots: Vec<Option<Entry>> = vec![None; arg_names.len()];
        if keys.is_empty() {
            if inputs.len() > arg_names.len() {
                return Err(format!(
                    "{} takes {} inputs, got {}",
                    op.op_name,
                    arg_names.len(),
                    inputs.len()
                ));
            }
            for (slot, entry) in slots.iter_mut().zip(inputs) {
                *slot = Some(entry);
            }
        } else {
            if keys.len() != inputs.len() {
                return Err(format!("{} keys for {} inputs", keys.len(), inputs.len()));
            }
            for (key, entry) in keys.iter().zip(inputs) {
                let position = arg_names
                    .iter()
                    .position(|arg| arg == key)
                    .ok_or_else(|| format!("{} has no input named '{key}'", op.op_name))?;
                if slots[position].is_some() {
                    return Err(format!("input '{key}' given twice"));
                }
                slots[position] = Some(entry);
            }
        }

        let mut node_inputs: Vec<Entry> = slots
            .into_iter()
            .zip(arg_names)
            .map(|(slot, arg)| slot.unwrap_or_else(|| Entry::of(Node::variable(format!("{name}_{arg}")))))
            .collect();
        for aux in op.kind.aux_states() {
            node_inputs.push(Entry::of(Node::variable(format!("{name}_{aux}"))));
        }

        let node = Arc::new(Node {
            id: next_node_id(),
            name: name.to_string(),
            op: Some(op.clone()),
            inputs: node_inputs,
        });
        *self = Graph::Composed(vec![Entry::of(node)]);
        Ok(())
    }

    /// The single output of this graph, for use as an input elsewhere.
    pub fn single_output(&self) -> Result<Entry, String> {
        match self {
            Graph::Atomic(op) => Err(format!("operator {} has not been composed", op.op_name)),
            Graph::Composed(outputs) if outputs.len() == 1 => Ok(outputs[0].clone()),
            Graph::Composed(outputs) => Err(format!(
                "cannot use a symbol with {} outputs as an input",
                outputs.len()
            )),
        }
    }

    fn outputs(&self) -> Result<&[Entry], String> {
        match self {
            Graph::Atomic(op) => Err(format!("operator {} has not been composed", op.op_name)),
            Graph::Composed(outputs) => Ok(outputs),
        }
    }

    pub fn layout(&self) -> Result<Layout, String> {
        Ok(layout(self.outputs()?))
    }

    pub fn list_arguments(&self) -> Vec<String> {
        match self {
            Graph::Atomic(op) => op.kind.arguments().iter().map(|s| s.to_string()).collect(),
            Graph::Composed(outputs) => names(&layout(outputs).arguments),
        }
    }

    pub fn list_outputs(&self) -> Vec<String> {
        match self {
            Graph::Atomic(_) => vec!["output".to_string()],
            Graph::Composed(outputs) => outputs.iter().map(|e| e.node.output_name()).collect(),
        }
    }

    pub fn list_auxiliary_states(&self) -> Vec<String> {
        match self {
            Graph::Atomic(op) => op.kind.aux_states().iter().map(|s| s.to_string()).collect(),
            Graph::Composed(outputs) => names(&layout(outputs).aux_states),
        }
    }

    /// Shape of every node output reachable from the known argument shapes.
    pub fn node_shapes(&self, known: &[(&str, &Shape)]) -> Result<HashMap<NodeId, Shape>, String> {
        let layout = self.layout()?;
        let mut shapes: HashMap<NodeId, Shape> = HashMap::new();

        for (name, shape) in known {
            let mut found = false;
            for node in layout.arguments.iter().filter(|n| n.name == *name) {
                shapes.insert(node.id, (*shape).clone());
                found = true;
            }
            if !found {
                return Err(format!("unknown argument '{name}'"));
            }
        }

        // Each pass either learns a new shape or stops.
        loop {
            let mut changed = false;
            for node in &layout.order {
                let Some(op) = &node.op else {
                    continue;
                };
                let mut inputs: Vec<Option<Shape>> = node
                    .inputs
                    .iter()
                    .map(|e| shapes.get(&e.node.id).cloned())
                    .collect();
                let out = op
                    .kind
                    .infer_shape(&mut inputs)
                    .map_err(|e| format!("{}: {e}", node.name))?;

                for (entry, shape) in node.inputs.iter().zip(inputs) {
                    if let Some(shape) = shape {
                        if entry.node.is_variable() && !shapes.contains_key(&entry.node.id) {
                            shapes.insert(entry.node.id, shape);
                            changed = true;
                        }
                    }
                }
                if let Some(out) = out {
                    match shapes.get(&node.id) {
                        Some(prev) if *prev != out => {
                            return Err(format!("{}: output shape changed from {prev} to {out}", node.name));
                        }
                        Some(_) => {}
                        None => {
                            shapes.insert(node.id, out);
                            changed = true;
                        }
                    }
                }
            }
            if !changed {
                break;
            }
        }
        Ok(shapes)
    }

    pub fn infer_shape(&self, known: &[(&str, &Shape)]) -> Result<InferredShapes, String> {
        let shapes = self.node_shapes(known)?;
        let layout = self.layout()?;
        let lookup = |id: &NodeId| shapes.get(id).cloned().unwrap_or_default();

        let arg_shapes: Vec<Shape> = layout.arguments.iter().map(|n| lookup(&n.id)).collect();
        let aux_shapes: Vec<Shape> = layout.aux_states.iter().map(|n| lookup(&n.id)).collect();
        let out_shapes: Vec<Shape> = self.outputs()?.iter().map(|e| lookup(&e.node.id)).collect();
        let complete = arg_shapes
            .iter()
            .chain(&aux_shapes)
            .chain(&out_shapes)
            .all(|s| !s.is_unknown());

        Ok(InferredShapes {
            arg_shapes,
            out_shapes,
            aux_shapes,
            complete,
        })
    }

    pub fn to_json(&self) -> Result<String, String> {
        let outputs = self.outputs()?;
        let order = layout(outputs).order;
        let position: HashMap<NodeId, usize> =
            order.iter().enumerate().map(|(i, n)| (n.id, i)).collect();

        let nodes = order
            .iter()
            .map(|node| JsonNode {
                op: node
                    .op
                    .as_ref()
                    .map_or_else(|| "null".to_string(), |op| op.op_name.clone()),
                name: node.name.clone(),
                attrs: node.op.as_ref().map(|op| op.attrs.clone()).unwrap_or_default(),
                inputs: node
                    .inputs
                    .iter()
                    .map(|e| [position[&e.node.id], e.index as usize, 0])
                    .collect(),
            })
            .collect();
        let arg_nodes = order
            .iter()
            .enumerate()
            .filter(|(_, n)| n.is_variable())
            .map(|(i, _)| i)
            .collect();
        let heads = outputs
            .iter()
            .map(|e| [position[&e.node.id], e.index as usize, 0])
            .collect();

        serde_json::to_string_pretty(&JsonGraph {
            nodes,
            arg_nodes,
            heads,
        })
        .map_err(|e| e.to_string())
    }

    pub fn from_json(json: &str) -> Result<Graph, String> {
        let parsed: JsonGraph = serde_json::from_str(json).map_err(|e| format!("malformed graph json: {e}"))?;
        let mut built: Vec<Arc<Node>> = Vec::with_capacity(parsed.nodes.len());

        for (i, json_node) in parsed.nodes.into_iter().enumerate() {
            let entry_at = |[id, index, _]: [usize; 3]| -> Result<Entry, String> {
                if id >= i || index != 0 {
                    return Err(format!("node {i} refers to invalid input [{id}, {index}]"));
                }
                Ok(Entry {
                    node: Arc::clone(&built[id]),
                    index: 0,
                })
            };
            let node = if json_node.op == "null" {
                Node::variable(json_node.name)
            } else {
                let op = Operator::new(&json_node.op, json_node.attrs)?;
                if json_node.inputs.len() != op.kind.num_inputs() {
                    return Err(format!(
                        "node {} expects {} inputs, got {}",
                        json_node.name,
                        op.kind.num_inputs(),
                        json_node.inputs.len()
                    ));
                }
                let inputs = json_node
                    .inputs
                    .into_iter()
                    .map(entry_at)
                    .collect::<Result<Vec<_>, _>>()?;
                Arc::new(Node {
                    id: next_node_id(),
                    name: json_node.name,
                    op: Some(op),
                    inputs,
                })
            };
            built.push(node);
        }

        if parsed.heads.is_empty() {
            return Err("graph json has no heads".to_string());
        }
        let outputs = parsed
            .heads
            .into_iter()
            .map(|[id, index, _]| match built.get(id) {
                Some(node) if index == 0 => Ok(Entry::of(Arc::clone(node))),
                _ => Err(format!("invalid head [{id}, {index}]")),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Graph::Composed(outputs))
    }
}

fn names(nodes: &[Arc<Node>]) -> Vec<String> {
    nodes.iter().map(|n| n.name.clone()).collect()
}

/// Depth-first post-order over everything reachable from `outputs`.
fn layout(outputs: &[Entry]) -> Layout {
    let mut visited = HashSet::new();
    let mut order = Vec::new();

    fn dfs(node: &Arc<Node>, visited: &mut HashSet<NodeId>, order: &mut Vec<Arc<Node>>) {
        if !visited.insert(node.id) {
            return;
        }
        for input in &node.inputs {
            dfs(&input.node, visited, order);
        }
        order.push(Arc::clone(node));
    }

    for entry in outputs {
        dfs(&entry.node, &mut visited, &mut order);
    }

    let mut aux_ids = HashSet::new();
    for node in &order {
        if let Some(op) = &node.op {
            let num_args = op.kind.arguments().len();
            for entry in &node.inputs[num_args..] {
                aux_ids.insert(entry.node.id);
            }
        }
    }
    let (aux_states, arguments): (Vec<_>, Vec<_>) = order
        .iter()
        .filter(|n| n.is_variable())
        .cloned()
        .partition(|n| aux_ids.contains(&n.id));

    Layout {
        order,
        arguments,
        aux_states,
    }
}

#[derive(Serialize, Deserialize)]
struct JsonGraph {
    nodes: Vec<JsonNode>,
    #[serde(default)]
    arg_nodes: Vec<usize>,
    heads: Vec<[usize; 3]>,
}

#[derive(Serialize, Deserialize)]
struct JsonNode {
    op: String,
    name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    attrs: BTreeMap<String, String>,
    inputs: Vec<[usize; 3]>,
}
