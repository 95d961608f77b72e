// rust/trainer-core/src/checkpoint/mod.rs

//! Checkpoints of session variable state.
//!
//! ```text
//! +------------------------+
//! | Header Length (4 bytes)|  <- u32 little-endian
//! +------------------------+
//! | Header (bincode)       |  <- CheckpointHeader serialized
//! +------------------------+
//! | Compressed Data        |  <- bincode CheckpointState, compressed per header
//! +------------------------+
//! ```
//!
//! Files are named `<name>-<step:010>.ckpt` so lexical and step order agree;
//! [`CheckpointReader::latest`] picks the highest step. Writes go through a
//! hidden temporary file and a rename when `atomic_writes` is set.
//!
//! # Example
//!
//! ```no_run
//! use trainer_core::checkpoint::{CheckpointReader, CheckpointState, CheckpointWriter};
//! use trainer_core::config::CheckpointConfig;
//!
//! # fn example() -> trainer_core::Result<()> {
//! let config = CheckpointConfig::default();
//! let writer = CheckpointWriter::new(config.clone());
//! let path = writer.write("model", &CheckpointState::new(100, Default::default()))?;
//!
//! let reader = CheckpointReader::new(&config.checkpoint_dir);
//! assert_eq!(reader.latest("model")?, Some(path));
//! # Ok(())
//! # }
//! ```

mod format;
mod reader;
mod writer;

pub use format::{checkpoint_filename, parse_step, CheckpointHeader, CheckpointState};
pub use reader::CheckpointReader;
pub use writer::CheckpointWriter;

/// Base name of the periodic training checkpoints.
pub const MODEL_CHECKPOINT: &str = "model";

/// Base name of the export bundle.
pub const SAVED_MODEL: &str = "saved_model";
