// rust/trainer-core/src/lib.rs

//! Split-learning trainer - core library
//!
//! Two parties, a leader and a follower, each hold part of a model and
//! train it together by exchanging activations and gradients over a
//! [`Bridge`]. This crate provides the exchange declaration layer
//! ([`TrainingModel`]), the execution context and session that run it, and
//! the [`TrainingCoordinator`] that drives the connect / iterate / terminate
//! lifecycle, plus checkpointing and export.

pub mod config;
pub mod error;

// Re-export commonly used types for convenience
pub use config::TrainerConfig;
pub use error::{Result, TrainerError};

pub mod alignment;
pub mod bridge;
pub use bridge::{Bridge, LocalBridge};

pub mod graph;
pub mod session;
pub mod tensor;
pub use graph::{Graph, Operation, Tensor};
pub use session::Session;
pub use tensor::{DType, Value};

pub mod model;
pub mod optimizer;
pub use model::{ExecutionSpec, Mode, Role, SpecParams, TrainingModel};
pub use optimizer::{GradientDescent, Optimizer};

pub mod checkpoint;
pub use checkpoint::{CheckpointReader, CheckpointState, CheckpointWriter};

pub mod coordinator;
pub mod hooks;
pub use coordinator::{Features, ServingInput, TrainingCoordinator};
pub use hooks::{CheckpointSaverHook, StopAtStepHook, StopSignalHook, TrainingHook};

#[cfg(test)]
mod testing;
