// rust/trainer-core/src/checkpoint/reader.rs

//! Checkpoint reader implementation.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::error::{Result, TrainerError};

use super::format::{parse_step, CheckpointHeader, CheckpointState};
use super::writer::calculate_checksum;

/// Finds, reads and verifies checkpoints in one directory.
pub struct CheckpointReader {
    dir: PathBuf,
}

impl CheckpointReader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the highest-step checkpoint of `name`, or `None` if the
    /// directory is missing or holds none.
    pub fn latest(&self, name: &str) -> Result<Option<PathBuf>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(TrainerError::storage_with_source(
                    &self.dir,
                    "failed to list checkpoint directory",
                    e,
                ))
            }
        };

        let mut best: Option<(u64, PathBuf)> = None;
        for entry in entries {
            let entry = entry.map_err(|e| {
                TrainerError::storage_with_source(&self.dir, "failed to list checkpoint directory", e)
            })?;
            let Some(step) = entry.file_name().to_str().and_then(|f| parse_step(name, f)) else {
                continue;
            };
            if best.as_ref().map_or(true, |(s, _)| step > *s) {
                best = Some((step, entry.path()));
            }
        }
        Ok(best.map(|(_, path)| path))
    }

    /// Reads the latest checkpoint of `name`, if there is one.
    pub fn read_latest(&self, name: &str) -> Result<Option<(CheckpointHeader, CheckpointState)>> {
        match self.latest(name)? {
            Some(path) => self.read(&path).map(Some),
            None => Ok(None),
        }
    }

    /// Reads, decompresses and verifies a checkpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The file cannot be read
    /// - The magic bytes or version are invalid
    /// - The checksum or size doesn't match
    /// - Decompression or decoding fails
    pub fn read(&self, path: &Path) -> Result<(CheckpointHeader, CheckpointState)> {
        let data = fs::read(path)
            .map_err(|e| TrainerError::storage_with_source(path, "failed to read checkpoint", e))?;

        if data.len() < 4 {
            return Err(TrainerError::checkpoint("checkpoint file too small"));
        }
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&data[..4]);
        let header_len = u32::from_le_bytes(len_bytes) as usize;
        if data.len() < 4 + header_len {
            return Err(TrainerError::checkpoint(
                "checkpoint file truncated: header incomplete",
            ));
        }

        let header = decode_header(&data[4..4 + header_len])?;
        let payload = decompress(&data[4 + header_len..], &header.compression)?;

        let checksum = calculate_checksum(&payload);
        if checksum != header.checksum {
            return Err(TrainerError::checkpoint(format!(
                "checksum mismatch: expected {}, got {}",
                header.checksum, checksum
            )));
        }
        if payload.len() as u64 != header.uncompressed_size {
            return Err(TrainerError::checkpoint(format!(
                "size mismatch: expected {}, got {}",
                header.uncompressed_size,
                payload.len()
            )));
        }

        let state: CheckpointState = bincode::deserialize(&payload).map_err(|e| {
            TrainerError::serialization(format!("failed to decode checkpoint state: {e}"))
        })?;
        if state.step != header.step {
            return Err(TrainerError::checkpoint(format!(
                "header step {} does not match payload step {}",
                header.step, state.step
            )));
        }
        Ok((header, state))
    }

    /// Reads only the header, without touching the payload.
    pub fn read_header(&self, path: &Path) -> Result<CheckpointHeader> {
        let mut file = fs::File::open(path)
            .map_err(|e| TrainerError::storage_with_source(path, "failed to open checkpoint", e))?;

        let mut len_bytes = [0u8; 4];
        file.read_exact(&mut len_bytes).map_err(|e| {
            TrainerError::checkpoint_with_source("failed to read header length", e)
        })?;
        let mut header_bytes = vec![0u8; u32::from_le_bytes(len_bytes) as usize];
        file.read_exact(&mut header_bytes)
            .map_err(|e| TrainerError::checkpoint_with_source("failed to read header", e))?;

        decode_header(&header_bytes)
    }
}

fn decode_header(bytes: &[u8]) -> Result<CheckpointHeader> {
    let header: CheckpointHeader = bincode::deserialize(bytes).map_err(|e| {
        TrainerError::serialization(format!("failed to deserialize checkpoint header: {e}"))
    })?;

    if !header.validate_magic() {
        return Err(TrainerError::checkpoint(format!(
            "invalid magic bytes: expected {:?}, got {:?}",
            CheckpointHeader::MAGIC,
            header.magic
        )));
    }
    if !header.validate_version() {
        return Err(TrainerError::checkpoint(format!(
            "unsupported version: expected {}, got {}",
            CheckpointHeader::VERSION,
            header.version
        )));
    }
    Ok(header)
}

fn decompress(data: &[u8], compression: &str) -> Result<Vec<u8>> {
    match compression {
        "none" => Ok(data.to_vec()),
        "lz4" => lz4_flex::decompress_size_prepended(data)
            .map_err(|e| TrainerError::checkpoint_with_source("lz4 decompression failed", e)),
        "zstd" => zstd::decode_all(data)
            .map_err(|e| TrainerError::checkpoint_with_source("zstd decompression failed", e)),
        _ => Err(TrainerError::checkpoint(format!(
            "unknown compression algorithm: {compression}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointWriter;
    use crate::config::CheckpointConfig;
    use crate::tensor::Value;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn setup(compression: &str) -> (CheckpointWriter, CheckpointReader, TempDir) {
        let temp = TempDir::new().unwrap();
        let config = CheckpointConfig {
            checkpoint_dir: temp.path().join("checkpoints"),
            compression: compression.to_string(),
            keep_last_n: 10,
            ..Default::default()
        };
        let reader = CheckpointReader::new(&config.checkpoint_dir);
        (CheckpointWriter::new(config), reader, temp)
    }

    fn state(step: u64) -> CheckpointState {
        let mut variables = BTreeMap::new();
        variables.insert("w".to_string(), Value::f32_vec(vec![1.5, -2.0]));
        variables.insert("global_step".to_string(), Value::scalar_i64(step as i64));
        CheckpointState::new(step, variables)
    }

    #[test]
    fn test_read_back_every_compression() {
        for compression in ["none", "lz4", "zstd"] {
            let (writer, reader, _temp) = setup(compression);
            let path = writer.write("model", &state(4)).unwrap();

            let (header, loaded) = reader.read(&path).unwrap();
            assert_eq!(header.compression, compression);
            assert_eq!(loaded, state(4));
        }
    }

    #[test]
    fn test_latest_picks_highest_step() {
        let (writer, reader, _temp) = setup("none");
        assert_eq!(reader.latest("model").unwrap(), None);

        writer.write("model", &state(9)).unwrap();
        let newest = writer.write("model", &state(10)).unwrap();
        writer.write("saved_model", &state(99)).unwrap();

        assert_eq!(reader.latest("model").unwrap(), Some(newest));
        let (_, loaded) = reader.read_latest("model").unwrap().unwrap();
        assert_eq!(loaded.step, 10);
    }

    #[test]
    fn test_missing_directory_has_no_latest() {
        let reader = CheckpointReader::new("/nonexistent/checkpoints");
        assert_eq!(reader.latest("model").unwrap(), None);
        assert!(reader.read_latest("model").unwrap().is_none());
    }

    #[test]
    fn test_read_header_keeps_metadata() {
        let (writer, reader, _temp) = setup("lz4");
        let mut metadata = BTreeMap::new();
        metadata.insert("role".to_string(), "leader".to_string());
        let path = writer
            .write_with_metadata("saved_model", &state(2), metadata)
            .unwrap();

        let header = reader.read_header(&path).unwrap();
        assert_eq!(header.step, 2);
        assert_eq!(header.metadata.get("role").map(String::as_str), Some("leader"));
    }

    #[test]
    fn test_corrupted_payload_detected() {
        let (writer, reader, _temp) = setup("none");
        let path = writer.write("model", &state(1)).unwrap();

        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(&path, bytes).unwrap();

        let err = reader.read(&path).unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[test]
    fn test_truncated_file_rejected() {
        let (_writer, reader, temp) = setup("none");
        let path = temp.path().join("short.ckpt");
        fs::write(&path, [1u8, 0]).unwrap();

        assert!(reader.read(&path).is_err());
    }
}
