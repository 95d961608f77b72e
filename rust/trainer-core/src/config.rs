// rust/trainer-core/src/config.rs

//! Configuration management for a training party.
//!
//! This module provides configuration parsing from TOML files, environment
//! variable overrides, and validation of configuration values.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{Result, TrainerError};
use crate::model::Role;

// Top-level configuration of one party.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    pub trainer: TrainerSection,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster: Option<ClusterConfig>,
    pub checkpoint: CheckpointConfig,
    pub export: ExportConfig,
}

/// Identity of this process in the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerSection {
    pub role: Role,
    // Index of this process in `cluster.workers`.
    pub worker_rank: usize,
}

/// Local worker topology. Absent for single-process parties.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// `host:port` of every worker of this party, rank order.
    pub workers: Vec<String>,
}

// Checkpoint configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    // Directory for storing checkpoints.
    pub checkpoint_dir: PathBuf,
    // Save every N iterations; 0 disables periodic saves.
    pub save_checkpoint_steps: u64,
    // Compression algorithm: "none", "lz4", or "zstd".
    pub compression: String,
    // Compression level (zstd only).
    pub compression_level: i32,
    // Number of recent checkpoints to keep.
    pub keep_last_n: usize,
    // Whether to use atomic writes (write to temp then rename).
    pub atomic_writes: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    pub export_dir: PathBuf,
}

impl Default for TrainerSection {
    fn default() -> Self {
        Self {
            role: Role::Leader,
            worker_rank: 0,
        }
    }
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            checkpoint_dir: PathBuf::from("./checkpoints"),
            save_checkpoint_steps: 1000,
            compression: "lz4".to_string(),
            compression_level: 1,
            keep_last_n: 3,
            atomic_writes: true,
        }
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            export_dir: PathBuf::from("./export"),
        }
    }
}

impl FromStr for TrainerConfig {
    type Err = TrainerError;

    /// Parse configuration from a TOML string.
    fn from_str(s: &str) -> Result<Self> {
        toml::from_str(s)
            .map_err(|e| TrainerError::config_with_source("failed to parse TOML config", e))
    }
}

impl TrainerConfig {
    // Load and validate configuration from a TOML file.
    //
    // # Errors
    //
    // Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            TrainerError::storage_with_source(path, "failed to read config file", e)
        })?;
        let config: Self = content.parse()?;
        config.validate()?;
        Ok(config)
    }

    // Apply environment variable overrides.
    //
    // Environment variables are prefixed with `FLT_` and use underscores
    // to separate nested fields. For example:
    // - `FLT_TRAINER_ROLE` overrides `trainer.role` ("leader" or "follower")
    // - `FLT_CLUSTER_WORKERS` overrides `cluster.workers` (comma separated)
    // - `FLT_CHECKPOINT_DIR` overrides `checkpoint.checkpoint_dir`
    // - `FLT_EXPORT_DIR` overrides `export.export_dir`
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(val) = std::env::var("FLT_TRAINER_ROLE") {
            if let Ok(role) = val.parse() {
                self.trainer.role = role;
            }
        }
        if let Ok(val) = std::env::var("FLT_TRAINER_WORKER_RANK") {
            if let Ok(v) = val.parse() {
                self.trainer.worker_rank = v;
            }
        }

        if let Ok(val) = std::env::var("FLT_CLUSTER_WORKERS") {
            let workers = val
                .split(',')
                .map(str::trim)
                .filter(|w| !w.is_empty())
                .map(String::from)
                .collect();
            self.cluster = Some(ClusterConfig { workers });
        }

        if let Ok(val) = std::env::var("FLT_CHECKPOINT_DIR") {
            self.checkpoint.checkpoint_dir = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("FLT_CHECKPOINT_SAVE_STEPS") {
            if let Ok(v) = val.parse() {
                self.checkpoint.save_checkpoint_steps = v;
            }
        }
        if let Ok(val) = std::env::var("FLT_CHECKPOINT_COMPRESSION") {
            self.checkpoint.compression = val;
        }
        if let Ok(val) = std::env::var("FLT_CHECKPOINT_COMPRESSION_LEVEL") {
            if let Ok(v) = val.parse() {
                self.checkpoint.compression_level = v;
            }
        }
        if let Ok(val) = std::env::var("FLT_CHECKPOINT_KEEP_LAST_N") {
            if let Ok(v) = val.parse() {
                self.checkpoint.keep_last_n = v;
            }
        }
        if let Ok(val) = std::env::var("FLT_CHECKPOINT_ATOMIC_WRITES") {
            if let Ok(v) = val.parse() {
                self.checkpoint.atomic_writes = v;
            }
        }

        if let Ok(val) = std::env::var("FLT_EXPORT_DIR") {
            self.export.export_dir = PathBuf::from(val);
        }

        self
    }

    // Validate all configuration values.
    //
    // # Errors
    //
    // Returns an error if any configuration value is invalid.
    pub fn validate(&self) -> Result<()> {
        if let Some(cluster) = &self.cluster {
            if cluster.workers.is_empty() {
                return Err(TrainerError::config(
                    "cluster.workers must not be empty when [cluster] is set",
                ));
            }
            if self.trainer.worker_rank >= cluster.workers.len() {
                return Err(TrainerError::config(format!(
                    "trainer.worker_rank {} is out of range for {} workers",
                    self.trainer.worker_rank,
                    cluster.workers.len()
                )));
            }
        }

        let valid_compression = ["none", "lz4", "zstd"];
        if !valid_compression.contains(&self.checkpoint.compression.as_str()) {
            return Err(TrainerError::config(format!(
                "checkpoint.compression must be one of: {}",
                valid_compression.join(", ")
            )));
        }

        if self.checkpoint.keep_last_n == 0 {
            return Err(TrainerError::config(
                "checkpoint.keep_last_n must be greater than 0",
            ));
        }

        Ok(())
    }
}
