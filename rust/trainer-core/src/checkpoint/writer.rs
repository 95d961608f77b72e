// rust/trainer-core/src/checkpoint/writer.rs

//! Checkpoint writer implementation.

use std::collections::BTreeMap;
use std::fs;
use std::hash::Hasher;
use std::io::Write;
use std::path::{Path, PathBuf};

use twox_hash::XxHash64;

use crate::config::CheckpointConfig;
use crate::error::{Result, TrainerError};

use super::format::{checkpoint_filename, parse_step, CheckpointHeader, CheckpointState};

/// Writes checkpoints with compression and integrity verification.
///
/// The `CheckpointWriter` handles:
/// - Compressing the payload with the configured algorithm
/// - Checksumming it for integrity verification
/// - Atomic writes (temp file then rename)
/// - Pruning all but the newest `keep_last_n` checkpoints of a name
pub struct CheckpointWriter {
    config: CheckpointConfig,
}

impl CheckpointWriter {
    pub fn new(config: CheckpointConfig) -> Self {
        Self { config }
    }

    pub fn dir(&self) -> &Path {
        &self.config.checkpoint_dir
    }

    /// Writes `state` under `name` and returns the path of the new file.
    pub fn write(&self, name: &str, state: &CheckpointState) -> Result<PathBuf> {
        self.write_with_metadata(name, state, BTreeMap::new())
    }

    /// Like [`CheckpointWriter::write`], recording `metadata` in the header.
    pub fn write_with_metadata(
        &self,
        name: &str,
        state: &CheckpointState,
        metadata: BTreeMap<String, String>,
    ) -> Result<PathBuf> {
        let dir = &self.config.checkpoint_dir;
        fs::create_dir_all(dir).map_err(|e| {
            TrainerError::storage_with_source(dir, "failed to create checkpoint directory", e)
        })?;

        let payload = bincode::serialize(state).map_err(|e| {
            TrainerError::serialization(format!("failed to serialize checkpoint state: {e}"))
        })?;
        let checksum = calculate_checksum(&payload);
        let (compressed, compression) = self.compress(&payload)?;

        let header = CheckpointHeader::new(compression, payload.len() as u64, checksum, state.step)
            .with_metadata(metadata);
        let header_bytes = bincode::serialize(&header).map_err(|e| {
            TrainerError::serialization(format!("failed to serialize checkpoint header: {e}"))
        })?;

        let header_len = header_bytes.len() as u32;
        let mut data = Vec::with_capacity(4 + header_bytes.len() + compressed.len());
        data.extend_from_slice(&header_len.to_le_bytes());
        data.extend_from_slice(&header_bytes);
        data.extend_from_slice(&compressed);

        let filename = checkpoint_filename(name, state.step);
        let final_path = dir.join(&filename);

        if self.config.atomic_writes {
            let temp_path = dir.join(format!(".{filename}.tmp"));
            write_to_path(&temp_path, &data)?;
            fs::rename(&temp_path, &final_path).map_err(|e| {
                TrainerError::storage_with_source(&final_path, "failed to rename checkpoint", e)
            })?;
        } else {
            write_to_path(&final_path, &data)?;
        }

        tracing::debug!(
            path = %final_path.display(),
            step = state.step,
            bytes = data.len(),
            "checkpoint written"
        );

        self.cleanup_old_checkpoints(name)?;
        Ok(final_path)
    }

    fn compress(&self, data: &[u8]) -> Result<(Vec<u8>, String)> {
        let compression = self.config.compression.as_str();

        let compressed = match compression {
            "none" => data.to_vec(),
            "lz4" => lz4_flex::compress_prepend_size(data),
            "zstd" => zstd::encode_all(data, self.config.compression_level)
                .map_err(|e| TrainerError::checkpoint_with_source("zstd compression failed", e))?,
            _ => {
                return Err(TrainerError::checkpoint(format!(
                    "unknown compression algorithm: {compression}"
                )));
            }
        };

        Ok((compressed, compression.to_string()))
    }

    /// Keeps only the newest `keep_last_n` checkpoints of `name`.
    fn cleanup_old_checkpoints(&self, name: &str) -> Result<()> {
        let dir = &self.config.checkpoint_dir;
        let entries = fs::read_dir(dir).map_err(|e| {
            TrainerError::storage_with_source(dir, "failed to list checkpoint directory", e)
        })?;

        let mut matching: Vec<(u64, PathBuf)> = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| {
                TrainerError::storage_with_source(dir, "failed to list checkpoint directory", e)
            })?;
            if let Some(step) = entry.file_name().to_str().and_then(|f| parse_step(name, f)) {
                matching.push((step, entry.path()));
            }
        }
        matching.sort();

        if matching.len() > self.config.keep_last_n {
            let to_delete = matching.len() - self.config.keep_last_n;
            for (step, path) in matching.iter().take(to_delete) {
                fs::remove_file(path).map_err(|e| {
                    TrainerError::storage_with_source(path, "failed to delete old checkpoint", e)
                })?;
                tracing::debug!(step, path = %path.display(), "old checkpoint removed");
            }
        }

        Ok(())
    }
}

pub(super) fn calculate_checksum(data: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(data);
    hasher.finish()
}

fn write_to_path(path: &Path, data: &[u8]) -> Result<()> {
    let mut file = fs::File::create(path)
        .map_err(|e| TrainerError::storage_with_source(path, "failed to create checkpoint", e))?;
    file.write_all(data)
        .and_then(|()| file.sync_all())
        .map_err(|e| TrainerError::storage_with_source(path, "failed to write checkpoint", e))
}
