// rust/trainer-core/src/session.rs

//! Executes a frozen [`Graph`] one iteration at a time.
//!
//! The session owns variable state across iterations. Exchange nodes are
//! scheduled as dataflow: a send is issued as soon as its value and control
//! inputs are ready, and receives are awaited concurrently, so the order in
//! which nodes were declared can never make two parties wait on each other.

use std::collections::{BTreeMap, HashMap, HashSet};

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};

use crate::bridge::Bridge;
use crate::checkpoint::CheckpointState;
use crate::error::{Result, TrainerError};
use crate::graph::{Graph, NodeId, NodeKind, Operation, Tensor};
use crate::model::Role;
use crate::tensor::Value;

type PendingReceive<'b> = BoxFuture<'b, (NodeId, Result<Value>)>;

#[derive(Debug)]
pub struct Session {
    graph: Graph,
    role: Role,
    variables: BTreeMap<String, Value>,
}

impl Session {
    /// Freezes `graph` and initializes every variable to its declared value.
    pub fn new(graph: Graph, role: Role) -> Self {
        let variables = graph.initial_variables();
        Self {
            graph,
            role,
            variables,
        }
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Current variable values, keyed by name.
    pub fn variables(&self) -> &BTreeMap<String, Value> {
        &self.variables
    }

    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    /// Copies current variable state for checkpointing at `step`.
    pub fn snapshot(&self, step: u64) -> CheckpointState {
        CheckpointState::new(step, self.variables.clone())
    }

    /// Replaces variable state with restored values.
    ///
    /// The restored set must cover exactly the graph's variables with
    /// matching element types.
    pub fn restore(&mut self, restored: BTreeMap<String, Value>) -> Result<()> {
        for (name, current) in &self.variables {
            match restored.get(name) {
                None => {
                    return Err(TrainerError::checkpoint(format!(
                        "checkpoint has no value for variable '{name}'"
                    )))
                }
                Some(value) if value.dtype() != current.dtype() => {
                    return Err(TrainerError::checkpoint(format!(
                        "variable '{name}' is {} but checkpoint holds {}",
                        current.dtype(),
                        value.dtype()
                    )))
                }
                Some(_) => {}
            }
        }
        if let Some(unknown) = restored.keys().find(|k| !self.variables.contains_key(*k)) {
            return Err(TrainerError::checkpoint(format!(
                "checkpoint holds unknown variable '{unknown}'"
            )));
        }

        self.variables = restored;
        Ok(())
    }

    /// Runs `op` for `iteration`, exchanging values through `bridge`.
    pub async fn run(&mut self, bridge: &dyn Bridge, op: &Operation, iteration: u64) -> Result<()> {
        let target = self.graph.check_op(op)?;
        self.execute(Some(bridge), &[target], iteration).await?;
        Ok(())
    }

    /// Computes `tensor` for `iteration`, exchanging values through `bridge`.
    pub async fn evaluate(
        &mut self,
        bridge: &dyn Bridge,
        tensor: &Tensor,
        iteration: u64,
    ) -> Result<Value> {
        let target = self.graph.check_tensor(tensor)?;
        let mut values = self.execute(Some(bridge), &[target], iteration).await?;
        values
            .remove(&target)
            .ok_or_else(|| TrainerError::graph("tensor produced no value"))
    }

    /// Computes `tensor` without a bridge. Fails if any exchange is reached.
    pub async fn evaluate_local(&mut self, tensor: &Tensor, iteration: u64) -> Result<Value> {
        let target = self.graph.check_tensor(tensor)?;
        let mut values = self.execute(None, &[target], iteration).await?;
        values
            .remove(&target)
            .ok_or_else(|| TrainerError::graph("tensor produced no value"))
    }

    async fn execute<'b>(
        &mut self,
        bridge: Option<&'b dyn Bridge>,
        targets: &[NodeId],
        iteration: u64,
    ) -> Result<HashMap<NodeId, Value>> {
        let role = self.role;
        let graph = &self.graph;
        let variables = &mut self.variables;

        let needed: Vec<NodeId> = graph.closure(targets).into_iter().collect();
        let mut values: HashMap<NodeId, Value> = HashMap::new();
        let mut done: HashSet<NodeId> = HashSet::with_capacity(needed.len());
        let mut receiving: HashSet<NodeId> = HashSet::new();
        let mut pending: FuturesUnordered<PendingReceive<'b>> = FuturesUnordered::new();

        while done.len() < needed.len() {
            let mut progressed = false;

            for &id in &needed {
                if done.contains(&id) || receiving.contains(&id) {
                    continue;
                }
                let node = graph.node(id);
                let ready = node
                    .inputs
                    .iter()
                    .chain(node.control_inputs.iter())
                    .all(|dep| done.contains(dep));
                if !ready {
                    continue;
                }

                match &node.kind {
                    NodeKind::Receive { channel } => {
                        let bridge = require_bridge(bridge, channel)?;
                        let dtype = node
                            .dtype
                            .ok_or_else(|| TrainerError::graph("receive without dtype"))?;
                        let channel = channel.clone();
                        pending.push(Box::pin(async move {
                            (id, bridge.receive(&channel, dtype).await)
                        }));
                        receiving.insert(id);
                    }
                    NodeKind::Send { channel } => {
                        let bridge = require_bridge(bridge, channel)?;
                        let value = input(&values, node.inputs[0])?.clone();
                        bridge
                            .send(channel, value)
                            .await
                            .map_err(|e| TrainerError::exchange(role, iteration, channel, e))?;
                        done.insert(id);
                    }
                    kind => {
                        let inputs = node
                            .inputs
                            .iter()
                            .map(|&dep| input(&values, dep))
                            .collect::<Result<Vec<_>>>()?;
                        let output = eval_local(kind, &inputs, variables, role, iteration)?;
                        if let Some(value) = output {
                            check_dtype(node.dtype, &value)?;
                            values.insert(id, value);
                        }
                        done.insert(id);
                    }
                }
                progressed = true;
            }

            if done.len() == needed.len() || progressed {
                continue;
            }

            let Some((id, received)) = pending.next().await else {
                return Err(TrainerError::graph("execution stalled with no pending exchange"));
            };
            let node = graph.node(id);
            let channel = match &node.kind {
                NodeKind::Receive { channel } => channel.as_str(),
                _ => "",
            };
            let value =
                received.map_err(|e| TrainerError::exchange(role, iteration, channel, e))?;
            check_dtype(node.dtype, &value)
                .map_err(|e| TrainerError::exchange(role, iteration, channel, e))?;
            receiving.remove(&id);
            values.insert(id, value);
            done.insert(id);
        }

        Ok(values)
    }
}

fn require_bridge<'b>(bridge: Option<&'b dyn Bridge>, channel: &str) -> Result<&'b dyn Bridge> {
    bridge.ok_or_else(|| {
        TrainerError::protocol(format!(
            "exchange '{channel}' reached while running without a bridge"
        ))
    })
}

fn input(values: &HashMap<NodeId, Value>, id: NodeId) -> Result<&Value> {
    values
        .get(&id)
        .ok_or_else(|| TrainerError::graph(format!("node {id} produced no value")))
}

fn check_dtype(declared: Option<crate::tensor::DType>, value: &Value) -> Result<()> {
    match declared {
        Some(dtype) if dtype != value.dtype() => Err(TrainerError::graph(format!(
            "declared {dtype} but produced {}",
            value.dtype()
        ))),
        _ => Ok(()),
    }
}

fn eval_local(
    kind: &NodeKind,
    inputs: &[&Value],
    variables: &mut BTreeMap<String, Value>,
    role: Role,
    iteration: u64,
) -> Result<Option<Value>> {
    match kind {
        NodeKind::Constant(value) => Ok(Some(value.clone())),
        NodeKind::Source(producer) => producer(iteration).map(Some),
        NodeKind::Variable { name, .. } => variables
            .get(name)
            .cloned()
            .map(Some)
            .ok_or_else(|| TrainerError::graph(format!("variable '{name}' is not initialized"))),
        NodeKind::Compute(kernel) => kernel(inputs).map(Some),
        NodeKind::Assign { variable } => {
            variables.insert(variable.clone(), inputs[1].clone());
            Ok(None)
        }
        NodeKind::AssertEqual { channel } => {
            if inputs[0] != inputs[1] {
                return Err(TrainerError::alignment(role, iteration, channel.as_str()));
            }
            Ok(Some(inputs[2].clone()))
        }
        NodeKind::Group => Ok(None),
        NodeKind::Send { .. } | NodeKind::Receive { .. } => {
            Err(TrainerError::graph("exchange nodes are scheduled by the session"))
        }
    }
}
