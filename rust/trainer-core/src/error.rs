// rust/trainer-core/src/error.rs

use std::path::PathBuf;
use thiserror::Error;

use crate::model::Role;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum TrainerError {

    #[error("{role} example ids diverge from the leader at iteration {iteration} (channel '{channel}')")]
    Alignment {
        role: Role,
        iteration: u64,
        channel: String,
    },

    #[error("exported model cannot exchange values: {sends} send(s) and {recvs} receive(s) declared")]
    ExportConstraint {
        sends: usize,
        recvs: usize,
    },

    #[error("bridge {operation} failed: {message}")]
    Bridge {
        operation: &'static str,
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("{role} exchange '{channel}' failed at iteration {iteration}")]
    Exchange {
        role: Role,
        iteration: u64,
        channel: String,
        #[source]
        source: Box<TrainerError>,
    },

    #[error("{role} failed to connect the bridge")]
    Connect {
        role: Role,
        #[source]
        source: Box<TrainerError>,
    },

    #[error("{role} iteration {iteration} failed")]
    Iteration {
        role: Role,
        iteration: u64,
        #[source]
        source: Box<TrainerError>,
    },

    #[error("Protocol error: {message}")]
    Protocol {
        message: String,
    },

    #[error("Graph error: {message}")]
    Graph {
        message: String,
    },

    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Checkpoint error: {message}")]
    Checkpoint {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Storage error at '{path}': {message}")]
    Storage {
        path: PathBuf,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Serialization error: {message}")]
    Serialization {
        message: String,
    },
}

pub type Result<T> = std::result::Result<T, TrainerError>;

// Convenience constructors
impl TrainerError {

    pub fn alignment(role: Role, iteration: u64, channel: impl Into<String>) -> Self {
        Self::Alignment {
            role,
            iteration,
            channel: channel.into(),
        }
    }

    pub fn bridge(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Bridge {
            operation,
            message: message.into(),
            source: None,
        }
    }

    pub fn exchange(role: Role, iteration: u64, channel: impl Into<String>, source: Self) -> Self {
        Self::Exchange {
            role,
            iteration,
            channel: channel.into(),
            source: Box::new(source),
        }
    }

    pub fn connect(role: Role, source: Self) -> Self {
        Self::Connect {
            role,
            source: Box::new(source),
        }
    }

    pub fn iteration(role: Role, iteration: u64, source: Self) -> Self {
        Self::Iteration {
            role,
            iteration,
            source: Box::new(source),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn graph(message: impl Into<String>) -> Self {
        Self::Graph {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn checkpoint(message: impl Into<String>) -> Self {
        Self::Checkpoint {
            message: message.into(),
            source: None,
        }
    }

    pub fn checkpoint_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Checkpoint {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn storage_with_source(
        path: impl Into<PathBuf>,
        message: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        Self::Storage {
            path: path.into(),
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Walks nested `Exchange`/`Iteration` wrappers down to the failure that
    /// caused them.
    pub fn root_cause(&self) -> &Self {
        match self {
            Self::Exchange { source, .. }
            | Self::Connect { source, .. }
            | Self::Iteration { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Returns `true` if this error (or the error it wraps) is an alignment
    /// failure.
    pub fn is_alignment(&self) -> bool {
        matches!(self.root_cause(), Self::Alignment { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment_message_names_party_and_channel() {
        let err = TrainerError::alignment(Role::Follower, 7, "_verify_example_ids");
        let msg = err.to_string();
        assert!(msg.contains("follower"));
        assert!(msg.contains("iteration 7"));
        assert!(msg.contains("_verify_example_ids"));
    }

    #[test]
    fn test_root_cause_unwraps_context() {
        let inner = TrainerError::bridge("receive", "peer terminated");
        let wrapped = TrainerError::iteration(
            Role::Leader,
            3,
            TrainerError::exchange(Role::Leader, 3, "act1_grad", inner),
        );

        assert!(matches!(
            wrapped.root_cause(),
            TrainerError::Bridge { operation: "receive", .. }
        ));
        assert!(!wrapped.is_alignment());
    }

    #[test]
    fn test_is_alignment_through_wrappers() {
        let err = TrainerError::iteration(
            Role::Follower,
            0,
            TrainerError::alignment(Role::Follower, 0, "_verify_example_ids"),
        );
        assert!(err.is_alignment());
    }

    #[test]
    fn test_source_chain() {
        use std::error::Error;

        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err = TrainerError::storage_with_source("/tmp/ckpt", "failed to open checkpoint", io);
        assert!(err.source().is_some());
    }
}
