// rust/trainer-core/src/model.rs

//! Exchange declarations for one construction pass.
//!
//! A [`TrainingModel`] is handed to the caller's model function. Every value
//! that has to cross the party boundary is declared through it, which lets
//! it pair forward sends with gradient returns, run the example id
//! handshake, and fold every exchange into the train op produced by
//! [`TrainingModel::make_spec`]. Once `make_spec` has run the model is
//! frozen and rejects further exchanges.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::alignment;
use crate::bridge::{gradient_channel, VERIFY_EXAMPLE_IDS};
use crate::error::{Result, TrainerError};
use crate::graph::{Graph, Operation, Tensor};
use crate::hooks::TrainingHook;
use crate::optimizer::Optimizer;
use crate::tensor::DType;

/// Which side of the two-party session this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Leader,
    Follower,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Leader => f.write_str("leader"),
            Role::Follower => f.write_str("follower"),
        }
    }
}

impl FromStr for Role {
    type Err = TrainerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "leader" => Ok(Role::Leader),
            "follower" => Ok(Role::Follower),
            other => Err(TrainerError::config(format!(
                "role must be 'leader' or 'follower', got '{other}'"
            ))),
        }
    }
}

/// What the model function is being built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Eval,
    Predict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Recv,
}

/// One declared exchange.
#[derive(Debug, Clone)]
pub struct ExchangeDescriptor {
    name: String,
    direction: Direction,
    tensor: Tensor,
    requires_grad: bool,
}

impl ExchangeDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// The value sent, or the value received.
    pub fn tensor(&self) -> &Tensor {
        &self.tensor
    }

    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }
}

/// Named model outputs.
pub type Predictions = BTreeMap<String, Tensor>;

/// Inputs to [`TrainingModel::make_spec`].
#[derive(Default)]
pub struct SpecParams {
    predictions: Predictions,
    loss: Option<Tensor>,
    train_op: Option<Operation>,
    hooks: Vec<Box<dyn TrainingHook>>,
}

impl SpecParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a named prediction.
    pub fn prediction(mut self, name: impl Into<String>, tensor: Tensor) -> Self {
        self.predictions.insert(name.into(), tensor);
        self
    }

    /// Sets a single unnamed prediction, exported as `output`.
    pub fn output(self, tensor: Tensor) -> Self {
        self.prediction("output", tensor)
    }

    pub fn loss(mut self, loss: Tensor) -> Self {
        self.loss = Some(loss);
        self
    }

    pub fn train_op(mut self, op: Operation) -> Self {
        self.train_op = Some(op);
        self
    }

    pub fn hook(mut self, hook: impl TrainingHook + 'static) -> Self {
        self.hooks.push(Box::new(hook));
        self
    }
}

/// Finalized output of a construction pass.
pub struct ExecutionSpec {
    mode: Mode,
    predictions: Predictions,
    loss: Option<Tensor>,
    train_op: Option<Operation>,
    hooks: Vec<Box<dyn TrainingHook>>,
}

impl fmt::Debug for ExecutionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionSpec")
            .field("mode", &self.mode)
            .field("predictions", &self.predictions)
            .field("loss", &self.loss)
            .field("train_op", &self.train_op)
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

impl ExecutionSpec {
    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn predictions(&self) -> &Predictions {
        &self.predictions
    }

    pub fn loss(&self) -> Option<&Tensor> {
        self.loss.as_ref()
    }

    /// In `Train` mode this also runs every declared exchange.
    pub fn train_op(&self) -> Option<Operation> {
        self.train_op
    }

    pub fn hooks(&self) -> &[Box<dyn TrainingHook>] {
        &self.hooks
    }

    pub(crate) fn into_hooks(self) -> Vec<Box<dyn TrainingHook>> {
        self.hooks
    }
}

/// Builder for the exchanges of one construction pass.
pub struct TrainingModel {
    role: Role,
    graph: Graph,
    example_ids: Option<Tensor>,
    exporting: bool,
    train_ops: Vec<Operation>,
    sends: Vec<ExchangeDescriptor>,
    recvs: Vec<ExchangeDescriptor>,
    finalized: bool,
}

impl TrainingModel {
    /// Creates a model for training. `example_ids` must be a string tensor
    /// of `graph`; every exchange is ordered after it.
    pub fn new(role: Role, graph: Graph, example_ids: Tensor) -> Result<Self> {
        Self::build(role, graph, Some(example_ids), false)
    }

    /// Creates a model for export. Exporting models may not declare any
    /// exchange.
    pub fn exporting(role: Role, graph: Graph, example_ids: Option<Tensor>) -> Result<Self> {
        Self::build(role, graph, example_ids, true)
    }

    fn build(
        role: Role,
        graph: Graph,
        example_ids: Option<Tensor>,
        exporting: bool,
    ) -> Result<Self> {
        if let Some(ids) = &example_ids {
            graph.check_tensor(ids)?;
            if ids.dtype() != DType::String {
                return Err(TrainerError::protocol(format!(
                    "example ids must be a string tensor, got {}",
                    ids.dtype()
                )));
            }
        }

        Ok(Self {
            role,
            graph,
            example_ids,
            exporting,
            train_ops: Vec::new(),
            sends: Vec::new(),
            recvs: Vec::new(),
            finalized: false,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_exporting(&self) -> bool {
        self.exporting
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn example_ids(&self) -> Option<&Tensor> {
        self.example_ids.as_ref()
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Access to the execution context for local computation.
    pub fn graph_mut(&mut self) -> &mut Graph {
        &mut self.graph
    }

    pub fn into_graph(self) -> Graph {
        self.graph
    }

    pub fn sends(&self) -> &[ExchangeDescriptor] {
        &self.sends
    }

    pub fn recvs(&self) -> &[ExchangeDescriptor] {
        &self.recvs
    }

    /// Operations that run every iteration on top of the caller's train op.
    pub fn train_ops(&self) -> &[Operation] {
        &self.train_ops
    }

    /// Adds the example id handshake: the leader sends a digest of its
    /// batch, the follower receives it and fails the iteration if it
    /// differs from its own. On the follower every exchange declared
    /// afterwards only runs once the check passed.
    pub fn verify_example_ids(&mut self) -> Result<()> {
        let ids = self.example_ids.clone().ok_or_else(|| {
            TrainerError::protocol("cannot verify example ids without an example id batch")
        })?;
        let local = self
            .graph
            .compute(&[&ids], DType::Int64, |xs| alignment::digest(xs[0]))?;

        match self.role {
            Role::Leader => {
                self.send(VERIFY_EXAMPLE_IDS, &local, false)?;
            }
            Role::Follower => {
                let received = self.recv(VERIFY_EXAMPLE_IDS, DType::Int64, false)?;
                let verified =
                    self.graph
                        .assert_equal(VERIFY_EXAMPLE_IDS, &local, &received, &ids)?;
                let check = self.graph.group_tensors(&[&verified])?;
                self.train_ops.push(check);
                // Later exchanges wait for the check instead of the raw batch.
                self.example_ids = Some(verified);
            }
        }
        Ok(())
    }

    /// Declares an outbound value.
    ///
    /// With `requires_grad` the peer is expected to return the gradient
    /// under `<name>_grad`; the tensor receiving it is returned.
    pub fn send(&mut self, name: &str, tensor: &Tensor, requires_grad: bool) -> Result<Option<Tensor>> {
        self.ensure_open("send", name)?;
        if self.sends.iter().any(|d| d.name == name) {
            return Err(TrainerError::protocol(format!(
                "'{name}' is already sent in this pass"
            )));
        }

        let control: Vec<&Tensor> = self.example_ids.iter().collect();
        let op = self.graph.send(name, tensor, &control)?;
        self.train_ops.push(op);
        self.sends.push(ExchangeDescriptor {
            name: name.to_string(),
            direction: Direction::Send,
            tensor: tensor.clone(),
            requires_grad,
        });

        if requires_grad {
            return self
                .recv(&gradient_channel(name), tensor.dtype(), false)
                .map(Some);
        }
        Ok(None)
    }

    /// Declares an inbound value and returns the tensor that receives it.
    ///
    /// With `requires_grad` the gradient of the loss with respect to the
    /// received value is sent back by [`TrainingModel::minimize`].
    pub fn recv(&mut self, name: &str, dtype: DType, requires_grad: bool) -> Result<Tensor> {
        self.ensure_open("receive", name)?;
        if self.recvs.iter().any(|d| d.name == name) {
            return Err(TrainerError::protocol(format!(
                "'{name}' is already received in this pass"
            )));
        }

        let control: Vec<&Tensor> = self.example_ids.iter().collect();
        let tensor = self.graph.receive(name, dtype, &control)?;
        let op = self.graph.group_tensors(&[&tensor])?;
        self.train_ops.push(op);
        self.recvs.push(ExchangeDescriptor {
            name: name.to_string(),
            direction: Direction::Recv,
            tensor: tensor.clone(),
            requires_grad,
        });
        Ok(tensor)
    }

    /// Computes gradients for the local variables and for every received
    /// value the peer wants a gradient for, sends the latter back, and
    /// returns the operation applying the former.
    ///
    /// `var_list` defaults to the graph's trainable variables. A received
    /// value whose gradient is absent gets no reply; the peer must not flag
    /// `requires_grad` on values the loss may not depend on.
    pub fn minimize(
        &mut self,
        optimizer: &dyn Optimizer,
        loss: &Tensor,
        global_step: Option<&Tensor>,
        var_list: Option<Vec<Tensor>>,
    ) -> Result<Operation> {
        self.ensure_open("minimize", "loss")?;
        let returned: Vec<(String, Tensor)> = self
            .recvs
            .iter()
            .filter(|d| d.requires_grad)
            .map(|d| (d.name.clone(), d.tensor.clone()))
            .collect();

        let var_list = var_list.unwrap_or_else(|| self.graph.trainable_variables());
        let mut combined: Vec<Tensor> = returned.iter().map(|(_, t)| t.clone()).collect();
        combined.extend(var_list);

        let grads_and_vars = optimizer.compute_gradients(&mut self.graph, loss, &combined)?;
        if grads_and_vars.len() != combined.len() {
            return Err(TrainerError::protocol(format!(
                "optimizer returned {} gradients for {} tensors",
                grads_and_vars.len(),
                combined.len()
            )));
        }

        let (to_peer, local) = grads_and_vars.split_at(returned.len());
        for ((name, _), (grad, _)) in returned.iter().zip(to_peer) {
            match grad {
                Some(grad) => {
                    self.send(&gradient_channel(name), grad, false)?;
                }
                None => {
                    tracing::warn!(
                        role = %self.role,
                        channel = %name,
                        "loss does not depend on received value, no gradient will be returned"
                    );
                }
            }
        }

        optimizer.apply_gradients(&mut self.graph, local, global_step)
    }

    /// Finalizes the pass.
    ///
    /// In `Train` mode the resulting train op groups the caller's train op
    /// with every declared exchange. Exporting models fail here if any
    /// exchange was declared.
    pub fn make_spec(&mut self, mode: Mode, params: SpecParams) -> Result<ExecutionSpec> {
        if self.finalized {
            return Err(TrainerError::protocol("model is already finalized"));
        }
        if self.exporting && (!self.sends.is_empty() || !self.recvs.is_empty()) {
            return Err(TrainerError::ExportConstraint {
                sends: self.sends.len(),
                recvs: self.recvs.len(),
            });
        }

        for tensor in params.predictions.values().chain(params.loss.iter()) {
            self.graph.check_tensor(tensor)?;
        }

        let train_op = match mode {
            Mode::Train => {
                let mut ops: Vec<Operation> = params.train_op.into_iter().collect();
                ops.extend(self.train_ops.iter().copied());
                Some(self.graph.group(&ops)?)
            }
            Mode::Eval | Mode::Predict => params.train_op,
        };

        self.finalized = true;
        Ok(ExecutionSpec {
            mode,
            predictions: params.predictions,
            loss: params.loss,
            train_op,
            hooks: params.hooks,
        })
    }

    fn ensure_open(&self, what: &str, name: &str) -> Result<()> {
        if self.finalized {
            return Err(TrainerError::protocol(format!(
                "cannot {what} '{name}' after the model was finalized"
            )));
        }
        Ok(())
    }
}
