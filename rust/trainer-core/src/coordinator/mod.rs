//! Drives one party through a two-party training session.
//!
//! ```text
//! SETUP ──► CONNECT ──► ITERATE* ──► TERMINATE
//!   │                                    ▲
//!   └──────── any failure ───────────────┘
//! ```
//!
//! SETUP builds the graph once through the caller's input and model
//! functions and restores the latest checkpoint. CONNECT opens the bridge
//! exactly once. Each iteration is framed by `start(i)` and `commit()`, and
//! hooks decide between iterations whether to stop. TERMINATE is issued
//! exactly once whichever way training ends.
//!
//! [`TrainingCoordinator::export_model`] builds a prediction graph with no
//! bridge involvement and writes it together with restored variables.

mod guard;
mod placement;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::bridge::Bridge;
use crate::checkpoint::{CheckpointReader, CheckpointWriter, MODEL_CHECKPOINT, SAVED_MODEL};
use crate::config::{CheckpointConfig, ExportConfig, TrainerConfig};
use crate::error::{Result, TrainerError};
use crate::graph::{Graph, Operation, Tensor};
use crate::hooks::{CheckpointSaverHook, RunContext, TrainingHook};
use crate::model::{ExecutionSpec, Mode, Role, TrainingModel};
use crate::session::Session;

use guard::BridgeSession;
pub use placement::{resolve_placement, ClusterSpec, Placement};

/// Feature key holding the example id batch.
pub const EXAMPLE_ID: &str = "example_id";

/// Named input tensors.
pub type Features = BTreeMap<String, Tensor>;

/// Builds the input pipeline into a graph.
pub trait InputFn: Send + Sync {
    /// Returns the features, which must include [`EXAMPLE_ID`] for
    /// training, and optional labels.
    fn input(&self, graph: &mut Graph) -> Result<(Features, Option<Tensor>)>;
}

impl<F> InputFn for F
where
    F: Fn(&mut Graph) -> Result<(Features, Option<Tensor>)> + Send + Sync,
{
    fn input(&self, graph: &mut Graph) -> Result<(Features, Option<Tensor>)> {
        self(graph)
    }
}

/// Builds the model on top of the input pipeline.
pub trait ModelFn: Send + Sync {
    fn build(
        &self,
        model: &mut TrainingModel,
        features: &Features,
        labels: Option<&Tensor>,
        mode: Mode,
    ) -> Result<ExecutionSpec>;
}

impl<F> ModelFn for F
where
    F: Fn(&mut TrainingModel, &Features, Option<&Tensor>, Mode) -> Result<ExecutionSpec>
        + Send
        + Sync,
{
    fn build(
        &self,
        model: &mut TrainingModel,
        features: &Features,
        labels: Option<&Tensor>,
        mode: Mode,
    ) -> Result<ExecutionSpec> {
        self(model, features, labels, mode)
    }
}

/// Serving-time inputs for export.
pub struct ServingInput {
    /// What the model function sees.
    pub features: Features,
    /// What a serving client feeds; recorded in the bundle by name.
    pub receiver_tensors: Features,
}

pub struct TrainingCoordinator {
    role: Role,
    model_fn: Arc<dyn ModelFn>,
    bridge: Arc<dyn Bridge>,
    placement: Option<Placement>,
    checkpoint: Option<CheckpointConfig>,
    export: Option<ExportConfig>,
}

impl TrainingCoordinator {
    /// Single-worker coordinator without checkpointing.
    pub fn new(role: Role, model_fn: impl ModelFn + 'static, bridge: Arc<dyn Bridge>) -> Self {
        Self {
            role,
            model_fn: Arc::new(model_fn),
            bridge,
            placement: None,
            checkpoint: None,
            export: None,
        }
    }

    /// Builds a coordinator from validated configuration.
    pub fn from_config(
        config: &TrainerConfig,
        model_fn: impl ModelFn + 'static,
        bridge: Arc<dyn Bridge>,
    ) -> Result<Self> {
        config.validate()?;
        let mut coordinator = Self::new(config.trainer.role, model_fn, bridge)
            .with_checkpoints(config.checkpoint.clone())
            .with_export(config.export.clone());
        if let Some(cluster) = &config.cluster {
            coordinator = coordinator.with_cluster(
                &ClusterSpec::new(cluster.workers.clone()),
                config.trainer.worker_rank,
            )?;
        }
        Ok(coordinator)
    }

    /// Places this worker in a local cluster. Only the chief saves
    /// checkpoints.
    pub fn with_cluster(mut self, cluster: &ClusterSpec, worker_rank: usize) -> Result<Self> {
        let placement = resolve_placement(cluster, worker_rank)?;
        tracing::info!(
            role = %self.role,
            local_address = %placement.local_address,
            worker_rank,
            "worker placed"
        );
        self.placement = Some(placement);
        Ok(self)
    }

    /// Restores from and saves to `config.checkpoint_dir`.
    #[must_use]
    pub fn with_checkpoints(mut self, config: CheckpointConfig) -> Self {
        self.checkpoint = Some(config);
        self
    }

    /// Sets where [`TrainingCoordinator::export`] writes bundles.
    #[must_use]
    pub fn with_export(mut self, config: ExportConfig) -> Self {
        self.export = Some(config);
        self
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn placement(&self) -> Option<&Placement> {
        self.placement.as_ref()
    }

    pub fn is_chief(&self) -> bool {
        self.placement.as_ref().map_or(true, |p| p.is_chief)
    }

    /// Trains until a hook requests a stop, returning the session with the
    /// final variable state.
    ///
    /// `hooks` run alongside those of the execution spec. The bridge is
    /// connected once and terminated once, including when training fails.
    pub async fn train(
        &self,
        input_fn: &dyn InputFn,
        hooks: Vec<Box<dyn TrainingHook>>,
    ) -> Result<Session> {
        let mut graph = Graph::new();
        let (features, labels) = input_fn.input(&mut graph)?;
        let example_ids = features.get(EXAMPLE_ID).cloned().ok_or_else(|| {
            TrainerError::protocol(format!("input features must contain '{EXAMPLE_ID}'"))
        })?;

        let mut model = TrainingModel::new(self.role, graph, example_ids)?;
        let spec = self
            .model_fn
            .build(&mut model, &features, labels.as_ref(), Mode::Train)?;
        if spec.mode() != Mode::Train {
            return Err(TrainerError::protocol(format!(
                "model function returned a {:?} spec for training",
                spec.mode()
            )));
        }
        let train_op = spec
            .train_op()
            .ok_or_else(|| TrainerError::protocol("training spec has no train op"))?;
        tracing::debug!(
            role = %self.role,
            sends = model.sends().len(),
            recvs = model.recvs().len(),
            "training graph built"
        );

        let mut session = Session::new(model.into_graph(), self.role);
        let base_step = self.restore(&mut session)?;

        let mut hooks: Vec<Box<dyn TrainingHook>> =
            spec.into_hooks().into_iter().chain(hooks).collect();
        if let Some(config) = &self.checkpoint {
            if self.is_chief() {
                hooks.push(Box::new(CheckpointSaverHook::new(config.clone())));
            }
        }
        for hook in &mut hooks {
            hook.begin(&session)?;
        }

        let guard = BridgeSession::new(self.bridge.clone(), self.role);
        let outcome = self
            .run(&guard, &mut session, train_op, &mut hooks, base_step)
            .await;
        let closed = guard.close().await;

        match (outcome, closed) {
            (Ok(iterations), Ok(())) => {
                tracing::info!(role = %self.role, iterations, "training finished");
                Ok(session)
            }
            (Ok(_), Err(e)) => Err(e),
            (Err(e), closed) => {
                if let Err(close_err) = closed {
                    tracing::warn!(role = %self.role, error = %close_err, "terminate after failure failed");
                }
                tracing::error!(role = %self.role, error = %e, "training failed");
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        guard: &BridgeSession,
        session: &mut Session,
        train_op: Operation,
        hooks: &mut [Box<dyn TrainingHook>],
        base_step: u64,
    ) -> Result<u64> {
        let role = self.role;
        guard.connect().await?;
        let bridge = guard.bridge();

        let mut iteration = 0;
        loop {
            tracing::debug!(%role, iteration, "iteration starting");
            bridge
                .start(iteration)
                .await
                .map_err(|e| TrainerError::iteration(role, iteration, e))?;
            session.run(bridge, &train_op, iteration).await?;
            bridge
                .commit()
                .await
                .map_err(|e| TrainerError::iteration(role, iteration, e))?;

            let mut ctx = RunContext::new(iteration, base_step + iteration + 1, session);
            for hook in hooks.iter_mut() {
                hook.after_iteration(&mut ctx)?;
            }
            iteration += 1;
            if ctx.stop_requested() {
                tracing::info!(%role, iterations = iteration, "stop requested");
                break;
            }
        }

        for hook in hooks.iter_mut() {
            hook.end(session)?;
        }
        Ok(iteration)
    }

    /// Restores the latest checkpoint, returning its step (0 if none).
    fn restore(&self, session: &mut Session) -> Result<u64> {
        let Some(config) = &self.checkpoint else {
            return Ok(0);
        };
        let reader = CheckpointReader::new(&config.checkpoint_dir);
        match reader.read_latest(MODEL_CHECKPOINT)? {
            Some((_, state)) => {
                session.restore(state.variables)?;
                tracing::info!(role = %self.role, step = state.step, "restored checkpoint");
                Ok(state.step)
            }
            None => Ok(0),
        }
    }

    /// Exports the latest checkpoint of the configured checkpoint directory
    /// into the configured export directory.
    pub fn export<F>(&self, serving_input_fn: F) -> Result<PathBuf>
    where
        F: FnOnce(&mut Graph) -> Result<ServingInput>,
    {
        let export = self
            .export
            .as_ref()
            .ok_or_else(|| TrainerError::config("no export directory configured"))?;
        let checkpoint = self
            .checkpoint
            .as_ref()
            .ok_or_else(|| TrainerError::config("no checkpoint directory configured"))?;
        self.export_model(&export.export_dir, serving_input_fn, &checkpoint.checkpoint_dir)
    }

    /// Writes a prediction bundle built from the latest checkpoint in
    /// `checkpoint_dir`, returning its path.
    ///
    /// The model may not declare any exchange; this is checked before the
    /// checkpoint is read.
    pub fn export_model<F>(
        &self,
        export_dir: &Path,
        serving_input_fn: F,
        checkpoint_dir: &Path,
    ) -> Result<PathBuf>
    where
        F: FnOnce(&mut Graph) -> Result<ServingInput>,
    {
        let mut graph = Graph::new();
        let serving = serving_input_fn(&mut graph)?;
        let example_ids = serving.features.get(EXAMPLE_ID).cloned();

        let mut model = TrainingModel::exporting(self.role, graph, example_ids)?;
        let spec = self
            .model_fn
            .build(&mut model, &serving.features, None, Mode::Predict)?;
        if !model.sends().is_empty() || !model.recvs().is_empty() {
            return Err(TrainerError::ExportConstraint {
                sends: model.sends().len(),
                recvs: model.recvs().len(),
            });
        }

        let reader = CheckpointReader::new(checkpoint_dir);
        let (_, state) = reader.read_latest(MODEL_CHECKPOINT)?.ok_or_else(|| {
            TrainerError::checkpoint(format!(
                "no checkpoint to export in {}",
                checkpoint_dir.display()
            ))
        })?;

        let mut session = Session::new(model.into_graph(), self.role);
        session.restore(state.variables)?;

        let mut metadata = BTreeMap::new();
        metadata.insert("role".to_string(), self.role.to_string());
        metadata.insert("inputs".to_string(), join_names(&serving.receiver_tensors));
        metadata.insert("outputs".to_string(), join_names(spec.predictions()));

        let base = self.checkpoint.clone().unwrap_or_default();
        let writer = CheckpointWriter::new(CheckpointConfig {
            checkpoint_dir: export_dir.to_path_buf(),
            keep_last_n: 1,
            ..base
        });
        let path = writer.write_with_metadata(SAVED_MODEL, &session.snapshot(state.step), metadata)?;
        tracing::info!(role = %self.role, path = %path.display(), step = state.step, "model exported");
        Ok(path)
    }
}

fn join_names(tensors: &BTreeMap<String, Tensor>) -> String {
    tensors.keys().cloned().collect::<Vec<_>>().join(",")
}
