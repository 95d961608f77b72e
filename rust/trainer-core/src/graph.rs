// rust/trainer-core/src/graph.rs

//! Explicit execution context for one construction pass.
//!
//! A [`Graph`] records the local computation a party runs every iteration:
//! input sources, variables, caller-supplied compute kernels and the
//! exchange nodes declared through [`crate::model::TrainingModel`]. Nodes are
//! append-only and may only reference nodes created before them, so creation
//! order is always a valid execution order.
//!
//! Handles carry the id of the graph that created them; using a handle with
//! another graph is rejected, which keeps independent construction passes
//! (for example concurrent tests) isolated from each other.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{Result, TrainerError};
use crate::tensor::{DType, Value};

static NEXT_GRAPH_ID: AtomicU64 = AtomicU64::new(1);

pub type NodeId = usize;

/// Local computation over already-evaluated inputs.
pub type Kernel = Arc<dyn Fn(&[&Value]) -> Result<Value> + Send + Sync>;

/// Produces the value of an input source for a given iteration.
pub type Producer = Arc<dyn Fn(u64) -> Result<Value> + Send + Sync>;

/// Handle to a value-producing node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Tensor {
    graph: u64,
    id: NodeId,
    dtype: DType,
}

impl Tensor {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }
}

/// Handle to a node that is run for its effect only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Operation {
    graph: u64,
    id: NodeId,
}

impl Operation {
    pub fn id(&self) -> NodeId {
        self.id
    }
}

pub(crate) enum NodeKind {
    Constant(Value),
    Source(Producer),
    Variable { name: String, initial: Value },
    Compute(Kernel),
    Send { channel: String },
    Receive { channel: String },
    Assign { variable: String },
    AssertEqual { channel: String },
    Group,
}

impl NodeKind {
    fn label(&self) -> &'static str {
        match self {
            NodeKind::Constant(_) => "constant",
            NodeKind::Source(_) => "source",
            NodeKind::Variable { .. } => "variable",
            NodeKind::Compute(_) => "compute",
            NodeKind::Send { .. } => "send",
            NodeKind::Receive { .. } => "receive",
            NodeKind::Assign { .. } => "assign",
            NodeKind::AssertEqual { .. } => "assert_equal",
            NodeKind::Group => "group",
        }
    }
}

pub(crate) struct Node {
    pub(crate) kind: NodeKind,
    pub(crate) inputs: Vec<NodeId>,
    pub(crate) control_inputs: Vec<NodeId>,
    pub(crate) dtype: Option<DType>,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("kind", &self.kind.label())
            .field("inputs", &self.inputs)
            .field("control_inputs", &self.control_inputs)
            .field("dtype", &self.dtype)
            .finish()
    }
}

/// Append-only dataflow graph.
#[derive(Debug)]
pub struct Graph {
    id: u64,
    nodes: Vec<Node>,
    variables: BTreeMap<String, NodeId>,
    trainable: Vec<NodeId>,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Graph {
    pub fn new() -> Self {
        Self {
            id: NEXT_GRAPH_ID.fetch_add(1, Ordering::Relaxed),
            nodes: Vec::new(),
            variables: BTreeMap::new(),
            trainable: Vec::new(),
        }
    }

    /// Number of nodes recorded so far.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn constant(&mut self, value: Value) -> Tensor {
        let dtype = value.dtype();
        self.push_tensor(NodeKind::Constant(value), Vec::new(), Vec::new(), dtype)
    }

    /// Adds an input fed by the local input pipeline once per iteration.
    pub fn source<F>(&mut self, dtype: DType, producer: F) -> Tensor
    where
        F: Fn(u64) -> Result<Value> + Send + Sync + 'static,
    {
        self.push_tensor(
            NodeKind::Source(Arc::new(producer)),
            Vec::new(),
            Vec::new(),
            dtype,
        )
    }

    /// Declares a named variable. Its value lives in the session and
    /// survives across iterations.
    pub fn variable(&mut self, name: &str, initial: Value, trainable: bool) -> Result<Tensor> {
        if self.variables.contains_key(name) {
            return Err(TrainerError::graph(format!(
                "variable '{name}' is already defined"
            )));
        }

        let dtype = initial.dtype();
        let tensor = self.push_tensor(
            NodeKind::Variable {
                name: name.to_string(),
                initial,
            },
            Vec::new(),
            Vec::new(),
            dtype,
        );
        self.variables.insert(name.to_string(), tensor.id);
        if trainable {
            self.trainable.push(tensor.id);
        }
        Ok(tensor)
    }

    /// Adds a local computation. The kernel must return a value of `dtype`.
    pub fn compute<F>(&mut self, inputs: &[&Tensor], dtype: DType, kernel: F) -> Result<Tensor>
    where
        F: Fn(&[&Value]) -> Result<Value> + Send + Sync + 'static,
    {
        let inputs = self.check_tensors(inputs)?;
        Ok(self.push_tensor(NodeKind::Compute(Arc::new(kernel)), inputs, Vec::new(), dtype))
    }

    /// Writes `value` into the variable behind `variable`.
    pub fn assign(&mut self, variable: &Tensor, value: &Tensor) -> Result<Operation> {
        self.check_tensor(variable)?;
        self.check_tensor(value)?;

        let name = match &self.nodes[variable.id].kind {
            NodeKind::Variable { name, .. } => name.clone(),
            other => {
                return Err(TrainerError::graph(format!(
                    "cannot assign to a {} node",
                    other.label()
                )))
            }
        };
        if variable.dtype != value.dtype {
            return Err(TrainerError::graph(format!(
                "cannot assign {} to {} variable '{}'",
                value.dtype, variable.dtype, name
            )));
        }

        Ok(self.push_op(
            NodeKind::Assign { variable: name },
            vec![variable.id, value.id],
            Vec::new(),
        ))
    }

    /// Groups operations into one that completes when all of them have run.
    pub fn group(&mut self, ops: &[Operation]) -> Result<Operation> {
        let control = ops
            .iter()
            .map(|op| self.check_op(op))
            .collect::<Result<Vec<_>>>()?;
        Ok(self.push_op(NodeKind::Group, Vec::new(), control))
    }

    /// Operation that completes once every tensor in `tensors` is computed.
    pub fn group_tensors(&mut self, tensors: &[&Tensor]) -> Result<Operation> {
        let control = self.check_tensors(tensors)?;
        Ok(self.push_op(NodeKind::Group, Vec::new(), control))
    }

    /// Variables declared trainable, in declaration order.
    pub fn trainable_variables(&self) -> Vec<Tensor> {
        self.trainable
            .iter()
            .map(|&id| self.tensor_handle(id))
            .collect()
    }

    /// Returns the name of the variable behind `tensor`, if it is one.
    pub fn variable_name(&self, tensor: &Tensor) -> Option<&str> {
        if tensor.graph != self.id {
            return None;
        }
        match &self.nodes.get(tensor.id)?.kind {
            NodeKind::Variable { name, .. } => Some(name),
            _ => None,
        }
    }

    pub(crate) fn send(
        &mut self,
        channel: &str,
        value: &Tensor,
        control: &[&Tensor],
    ) -> Result<Operation> {
        self.check_tensor(value)?;
        let control = self.check_tensors(control)?;
        Ok(self.push_op(
            NodeKind::Send {
                channel: channel.to_string(),
            },
            vec![value.id],
            control,
        ))
    }

    pub(crate) fn receive(
        &mut self,
        channel: &str,
        dtype: DType,
        control: &[&Tensor],
    ) -> Result<Tensor> {
        let control = self.check_tensors(control)?;
        Ok(self.push_tensor(
            NodeKind::Receive {
                channel: channel.to_string(),
            },
            Vec::new(),
            control,
            dtype,
        ))
    }

    /// Passes `through` on once `local` and `received` are equal, failing
    /// the iteration with an alignment error otherwise.
    pub(crate) fn assert_equal(
        &mut self,
        channel: &str,
        local: &Tensor,
        received: &Tensor,
        through: &Tensor,
    ) -> Result<Tensor> {
        let inputs = self.check_tensors(&[local, received, through])?;
        Ok(self.push_tensor(
            NodeKind::AssertEqual {
                channel: channel.to_string(),
            },
            inputs,
            Vec::new(),
            through.dtype,
        ))
    }

    pub(crate) fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub(crate) fn check_op(&self, op: &Operation) -> Result<NodeId> {
        if op.graph != self.id || op.id >= self.nodes.len() {
            return Err(TrainerError::graph("operation does not belong to this graph"));
        }
        Ok(op.id)
    }

    pub(crate) fn check_tensor(&self, tensor: &Tensor) -> Result<NodeId> {
        if tensor.graph != self.id || tensor.id >= self.nodes.len() {
            return Err(TrainerError::graph("tensor does not belong to this graph"));
        }
        Ok(tensor.id)
    }

    /// Initial values of every declared variable, keyed by name.
    pub(crate) fn initial_variables(&self) -> BTreeMap<String, Value> {
        self.nodes
            .iter()
            .filter_map(|node| match &node.kind {
                NodeKind::Variable { name, initial } => Some((name.clone(), initial.clone())),
                _ => None,
            })
            .collect()
    }

    /// Every node `targets` transitively depends on, including themselves,
    /// in ascending (= executable) order.
    pub(crate) fn closure(&self, targets: &[NodeId]) -> BTreeSet<NodeId> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<NodeId> = targets.to_vec();
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            let node = &self.nodes[id];
            stack.extend(node.inputs.iter().chain(node.control_inputs.iter()).copied());
        }
        seen
    }

    fn check_tensors(&self, tensors: &[&Tensor]) -> Result<Vec<NodeId>> {
        tensors.iter().map(|t| self.check_tensor(t)).collect()
    }

    fn tensor_handle(&self, id: NodeId) -> Tensor {
        Tensor {
            graph: self.id,
            id,
            dtype: self.nodes[id].dtype.unwrap_or(DType::Float32),
        }
    }

    fn push_tensor(
        &mut self,
        kind: NodeKind,
        inputs: Vec<NodeId>,
        control_inputs: Vec<NodeId>,
        dtype: DType,
    ) -> Tensor {
        let id = self.nodes.len();
        self.nodes.push(Node {
            kind,
            inputs,
            control_inputs,
            dtype: Some(dtype),
        });
        Tensor {
            graph: self.id,
            id,
            dtype,
        }
    }

    fn push_op(
        &mut self,
        kind: NodeKind,
        inputs: Vec<NodeId>,
        control_inputs: Vec<NodeId>,
    ) -> Operation {
        let id = self.nodes.len();
        self.nodes.push(Node {
            kind,
            inputs,
            control_inputs,
            dtype: None,
        });
        Operation { graph: self.id, id }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nodes_only_reference_earlier_nodes() {
        let mut graph = Graph::new();
        let a = graph.constant(Value::f32_vec(vec![1.0]));
        let b = graph
            .compute(&[&a], DType::Float32, |xs| Ok(xs[0].clone()))
            .unwrap();

        assert!(a.id() < b.id());
        assert_eq!(graph.node(b.id()).inputs, vec![a.id()]);
    }

    #[test]
    fn test_foreign_handles_rejected() {
        let mut first = Graph::new();
        let mut second = Graph::new();
        let foreign = first.constant(Value::scalar_f32(1.0));

        let err = second
            .compute(&[&foreign], DType::Float32, |xs| Ok(xs[0].clone()))
            .unwrap_err();
        assert!(err.to_string().contains("does not belong"));
    }

    #[test]
    fn test_duplicate_variable_rejected() {
        let mut graph = Graph::new();
        graph.variable("w", Value::scalar_f32(0.0), true).unwrap();
        assert!(graph.variable("w", Value::scalar_f32(1.0), true).is_err());
    }

    #[test]
    fn test_trainable_variables_in_declaration_order() {
        let mut graph = Graph::new();
        let w = graph.variable("w", Value::scalar_f32(0.0), true).unwrap();
        graph.variable("step", Value::scalar_i64(0), false).unwrap();
        let b = graph.variable("b", Value::scalar_f32(0.0), true).unwrap();

        assert_eq!(graph.trainable_variables(), vec![w, b]);
        assert_eq!(graph.initial_variables().len(), 3);
    }

    #[test]
    fn test_assign_requires_variable() {
        let mut graph = Graph::new();
        let c = graph.constant(Value::scalar_f32(1.0));
        let w = graph.variable("w", Value::scalar_f32(0.0), true).unwrap();
        let step = graph.variable("step", Value::scalar_i64(0), false).unwrap();

        assert!(graph.assign(&c, &w).is_err());
        assert!(graph.assign(&step, &c).is_err());
        assert!(graph.assign(&w, &c).is_ok());
        assert_eq!(graph.variable_name(&w), Some("w"));
        assert_eq!(graph.variable_name(&c), None);
    }

    #[test]
    fn test_closure_follows_control_inputs() {
        let mut graph = Graph::new();
        let ids = graph.constant(Value::strings(["a"]));
        let x = graph.constant(Value::scalar_f32(1.0));
        let unrelated = graph.constant(Value::scalar_f32(2.0));
        let send = graph.send("x", &x, &[&ids]).unwrap();

        let closure = graph.closure(&[send.id()]);
        assert!(closure.contains(&ids.id()));
        assert!(closure.contains(&x.id()));
        assert!(!closure.contains(&unrelated.id()));
    }

    #[test]
    fn test_group_tensors_pulls_in_values() {
        let mut graph = Graph::new();
        let x = graph.receive("x", DType::Float32, &[]).unwrap();
        let op = graph.group_tensors(&[&x]).unwrap();

        assert!(graph.closure(&[op.id()]).contains(&x.id()));
        assert_eq!(graph.node(op.id()).dtype, None);
    }
}
