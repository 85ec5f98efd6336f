use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use usdtg_core::{CompilationResult, CoreError, Stage as CoreStage};

use crate::session::SessionState;

/// Wire-level error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    Resource,
    Syntax,
    Semantic,
    Security,
    Timeout,
    Process,
    Busy,
    Io,
    Protocol,
    Conflict,
    NotFound,
    Cancelled,
    Terminated,
    Config,
    Internal,
}

/// Component a failure originated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorStage {
    Protocol,
    Session,
    Files,
    Compile,
    Process,
}

#[derive(Debug, Error)]
pub enum IdeError {
    #[error("{path} is {size} bytes, exceeding the {limit} byte limit")]
    FileTooLarge { path: String, size: u64, limit: usize },
    #[error("path `{0}` must be relative to the project and must not contain `..`")]
    InvalidPath(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("stale write to {path}: based on version {expected}, current version is {actual}")]
    Conflict { path: String, expected: u64, actual: u64 },
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("session is busy ({0})")]
    Busy(SessionState),
    #[error("request queue is full")]
    QueueFull,
    #[error("session has been terminated")]
    Terminated,
    #[error("`{program}` did not finish within {timeout:?}")]
    Timeout {
        program: String,
        timeout: Duration,
        pid: Option<u32>,
    },
    #[error("compilation did not finish within {0:?}")]
    CompileTimeout(Duration),
    #[error("failed to start `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("process `{program}` failed: {message}")]
    Process { program: String, message: String },
    #[error("`{0}` was terminated on request")]
    Killed(String),
    #[error("malformed message: {0}")]
    Protocol(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("compiler worker failed: {0}")]
    Worker(String),
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl IdeError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        IdeError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            IdeError::FileTooLarge { .. } | IdeError::QueueFull => ErrorKind::Resource,
            IdeError::InvalidPath(_) | IdeError::Protocol(_) => ErrorKind::Protocol,
            IdeError::NotFound(_) => ErrorKind::NotFound,
            IdeError::AlreadyExists(_) | IdeError::Conflict { .. } => ErrorKind::Conflict,
            IdeError::Io { .. } => ErrorKind::Io,
            IdeError::Busy(_) => ErrorKind::Busy,
            IdeError::Terminated => ErrorKind::Terminated,
            IdeError::Timeout { .. } | IdeError::CompileTimeout(_) => ErrorKind::Timeout,
            IdeError::Spawn { .. } | IdeError::Process { .. } => ErrorKind::Process,
            IdeError::Killed(_) => ErrorKind::Cancelled,
            IdeError::Config(_) => ErrorKind::Config,
            IdeError::Worker(_) => ErrorKind::Internal,
            IdeError::Core(CoreError::SourceIo(_) | CoreError::ProjectWalk { .. }) => ErrorKind::Io,
            IdeError::Core(_) => ErrorKind::Config,
        }
    }

    pub fn stage(&self) -> ErrorStage {
        match self {
            IdeError::FileTooLarge { .. }
            | IdeError::InvalidPath(_)
            | IdeError::NotFound(_)
            | IdeError::AlreadyExists(_)
            | IdeError::Conflict { .. }
            | IdeError::Io { .. } => ErrorStage::Files,
            IdeError::Busy(_) | IdeError::Terminated | IdeError::Config(_) => ErrorStage::Session,
            IdeError::QueueFull | IdeError::Protocol(_) => ErrorStage::Protocol,
            IdeError::CompileTimeout(_) | IdeError::Worker(_) | IdeError::Core(_) => {
                ErrorStage::Compile
            }
            IdeError::Timeout { .. }
            | IdeError::Spawn { .. }
            | IdeError::Process { .. }
            | IdeError::Killed(_) => ErrorStage::Process,
        }
    }
}

/// Error kind for a compilation that finished with `success == false`.
pub fn compile_failure_kind(result: &CompilationResult) -> Option<ErrorKind> {
    if result.success() {
        return None;
    }
    if result.was_cancelled() {
        return Some(ErrorKind::Cancelled);
    }
    Some(match result.failed_stage() {
        Some(CoreStage::Input) => ErrorKind::Resource,
        Some(CoreStage::Syntax) => ErrorKind::Syntax,
        Some(CoreStage::Semantic) => ErrorKind::Semantic,
        Some(CoreStage::Security) => ErrorKind::Security,
        Some(CoreStage::Optimization | CoreStage::Codegen) | None => ErrorKind::Internal,
    })
}
