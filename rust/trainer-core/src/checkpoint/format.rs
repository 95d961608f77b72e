// rust/trainer-core/src/checkpoint/format.rs

//! Checkpoint file format.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::tensor::Value;

/// Header for a checkpoint file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointHeader {
    /// Magic bytes identifying this as a checkpoint file ("FLTC")
    pub magic: [u8; 4],
    pub version: u32,
    /// Compression algorithm used ("none", "lz4", or "zstd")
    pub compression: String,
    /// Size of the payload before compression
    pub uncompressed_size: u64,
    /// XXHash64 checksum of the uncompressed payload
    pub checksum: u64,
    pub step: u64,
    pub metadata: BTreeMap<String, String>,
}

impl CheckpointHeader {
    pub const MAGIC: [u8; 4] = *b"FLTC";

    pub const VERSION: u32 = 1;

    pub fn new(compression: String, uncompressed_size: u64, checksum: u64, step: u64) -> Self {
        Self {
            magic: Self::MAGIC,
            version: Self::VERSION,
            compression,
            uncompressed_size,
            checksum,
            step,
            metadata: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn validate_magic(&self) -> bool {
        self.magic == Self::MAGIC
    }

    pub fn validate_version(&self) -> bool {
        self.version == Self::VERSION
    }
}

/// Payload of a checkpoint: the global step and every variable by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub step: u64,
    pub variables: BTreeMap<String, Value>,
}

impl CheckpointState {
    pub fn new(step: u64, variables: BTreeMap<String, Value>) -> Self {
        Self { step, variables }
    }
}

/// File name for the checkpoint of `name` at `step`.
pub fn checkpoint_filename(name: &str, step: u64) -> String {
    format!("{name}-{step:010}.ckpt")
}

/// Step encoded in a checkpoint file name produced for `name`, if any.
pub fn parse_step(name: &str, filename: &str) -> Option<u64> {
    filename
        .strip_prefix(name)?
        .strip_prefix('-')?
        .strip_suffix(".ckpt")?
        .parse()
        .ok()
}
