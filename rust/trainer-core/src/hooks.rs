// rust/trainer-core/src/hooks.rs

//! Callbacks run by the coordinator between iterations.
//!
//! Hooks are only consulted after an iteration has been committed, so a
//! stop request never interrupts an iteration in flight.

use tokio::sync::watch;

use crate::checkpoint::{CheckpointWriter, MODEL_CHECKPOINT};
use crate::config::CheckpointConfig;
use crate::error::Result;
use crate::session::Session;

/// What a hook sees after an iteration.
pub struct RunContext<'a> {
    iteration: u64,
    global_step: u64,
    session: &'a Session,
    stop_requested: bool,
}

impl<'a> RunContext<'a> {
    pub(crate) fn new(iteration: u64, global_step: u64, session: &'a Session) -> Self {
        Self {
            iteration,
            global_step,
            session,
            stop_requested: false,
        }
    }

    /// Bridge iteration id of the iteration just committed.
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    /// Iterations completed in total, including those of restored
    /// checkpoints.
    pub fn global_step(&self) -> u64 {
        self.global_step
    }

    pub fn session(&self) -> &Session {
        self.session
    }

    pub fn request_stop(&mut self) {
        self.stop_requested = true;
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested
    }
}

pub trait TrainingHook: Send {
    /// Called once after the session is created, before connecting.
    fn begin(&mut self, _session: &Session) -> Result<()> {
        Ok(())
    }

    fn after_iteration(&mut self, ctx: &mut RunContext<'_>) -> Result<()>;

    /// Called once when training stops on request.
    fn end(&mut self, _session: &Session) -> Result<()> {
        Ok(())
    }
}

/// Stops after a fixed number of iterations of this run.
pub struct StopAtStepHook {
    num_steps: u64,
}

impl StopAtStepHook {
    /// At least one iteration always runs.
    pub fn new(num_steps: u64) -> Self {
        Self { num_steps }
    }
}

impl TrainingHook for StopAtStepHook {
    fn after_iteration(&mut self, ctx: &mut RunContext<'_>) -> Result<()> {
        if ctx.iteration() + 1 >= self.num_steps {
            ctx.request_stop();
        }
        Ok(())
    }
}

/// Stops once an external signal flips to `true`.
pub struct StopSignalHook {
    signal: watch::Receiver<bool>,
}

impl StopSignalHook {
    pub fn new(signal: watch::Receiver<bool>) -> Self {
        Self { signal }
    }
}

impl TrainingHook for StopSignalHook {
    fn after_iteration(&mut self, ctx: &mut RunContext<'_>) -> Result<()> {
        if *self.signal.borrow() {
            tracing::info!(iteration = ctx.iteration(), "stop signal received");
            ctx.request_stop();
        }
        Ok(())
    }
}

/// Saves variable state every `save_checkpoint_steps` global steps and
/// once more when training ends.
pub struct CheckpointSaverHook {
    writer: CheckpointWriter,
    every: u64,
    last_step: Option<u64>,
    last_saved: Option<u64>,
}

impl CheckpointSaverHook {
    pub fn new(config: CheckpointConfig) -> Self {
        let every = config.save_checkpoint_steps;
        Self {
            writer: CheckpointWriter::new(config),
            every,
            last_step: None,
            last_saved: None,
        }
    }

    fn save(&mut self, session: &Session, step: u64) -> Result<()> {
        let path = self.writer.write(MODEL_CHECKPOINT, &session.snapshot(step))?;
        tracing::info!(step, path = %path.display(), "checkpoint saved");
        self.last_saved = Some(step);
        Ok(())
    }
}

impl TrainingHook for CheckpointSaverHook {
    fn after_iteration(&mut self, ctx: &mut RunContext<'_>) -> Result<()> {
        let step = ctx.global_step();
        self.last_step = Some(step);
        if self.every > 0 && step % self.every == 0 {
            self.save(ctx.session(), step)?;
        }
        Ok(())
    }

    fn end(&mut self, session: &Session) -> Result<()> {
        match self.last_step {
            Some(step) if self.last_saved != Some(step) => self.save(session, step),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointReader;
    use crate::graph::Graph;
    use crate::model::Role;
    use crate::tensor::Value;
    use tempfile::TempDir;

    fn session() -> Session {
        let mut graph = Graph::new();
        graph.variable("w", Value::scalar_f32(1.0), true).unwrap();
        Session::new(graph, Role::Leader)
    }

    #[test]
    fn test_stop_at_step() {
        let session = session();
        let mut hook = StopAtStepHook::new(3);

        let stops: Vec<bool> = (0..4)
            .map(|i| {
                let mut ctx = RunContext::new(i, i + 1, &session);
                hook.after_iteration(&mut ctx).unwrap();
                ctx.stop_requested()
            })
            .collect();
        assert_eq!(stops, vec![false, false, true, true]);
    }

    #[test]
    fn test_stop_signal() {
        let session = session();
        let (tx, rx) = watch::channel(false);
        let mut hook = StopSignalHook::new(rx);

        let mut ctx = RunContext::new(0, 1, &session);
        hook.after_iteration(&mut ctx).unwrap();
        assert!(!ctx.stop_requested());

        tx.send(true).unwrap();
        let mut ctx = RunContext::new(1, 2, &session);
        hook.after_iteration(&mut ctx).unwrap();
        assert!(ctx.stop_requested());
    }

    #[test]
    fn test_checkpoint_saver_interval_and_end() {
        let temp = TempDir::new().unwrap();
        let config = CheckpointConfig {
            checkpoint_dir: temp.path().to_path_buf(),
            save_checkpoint_steps: 2,
            keep_last_n: 10,
            ..Default::default()
        };
        let reader = CheckpointReader::new(temp.path());
        let session = session();
        let mut hook = CheckpointSaverHook::new(config);

        for i in 0..3 {
            let mut ctx = RunContext::new(i, i + 1, &session);
            hook.after_iteration(&mut ctx).unwrap();
        }
        let (_, saved) = reader.read_latest(MODEL_CHECKPOINT).unwrap().unwrap();
        assert_eq!(saved.step, 2);

        hook.end(&session).unwrap();
        let (_, saved) = reader.read_latest(MODEL_CHECKPOINT).unwrap().unwrap();
        assert_eq!(saved.step, 3);
        assert_eq!(saved.variables, session.variables().clone());
    }

    #[test]
    fn test_checkpoint_saver_skips_end_without_iterations() {
        let temp = TempDir::new().unwrap();
        let config = CheckpointConfig {
            checkpoint_dir: temp.path().join("never"),
            ..Default::default()
        };
        let mut hook = CheckpointSaverHook::new(config);

        hook.end(&session()).unwrap();
        assert!(!temp.path().join("never").exists());
    }
}
