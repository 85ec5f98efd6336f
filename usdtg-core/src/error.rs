use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("failed to read source: {0}")]
    SourceIo(#[from] std::io::Error),
    #[error("failed to walk project directory {path}: {message}")]
    ProjectWalk { path: PathBuf, message: String },
    #[error("invalid optimization level {0} (expected 0..=3)")]
    InvalidOptimizationLevel(u8),
    #[error("invalid pipeline configuration: {0}")]
    InvalidConfig(String),
    #[error("malformed bytecode: {0}")]
    MalformedBytecode(#[from] wasmparser::BinaryReaderError),
}
