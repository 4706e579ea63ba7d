//! Error taxonomy for the batch engine.
//!
//! Per-file errors are contained and the batch continues; infrastructure
//! errors are fatal. [`EngineError::is_fatal`] is the single place that
//! encodes which is which.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("probe failed for {path}: {reason}")]
    ProbeFailed { path: PathBuf, reason: String },

    #[error("encoder exited with code {code:?} for {path}: {tail}")]
    EncoderExitNonZero {
        path: PathBuf,
        code: Option<i32>,
        tail: String,
    },

    #[error("validation failed for {path}: {reason}")]
    ValidationFailed { path: PathBuf, reason: String },

    #[error("shutdown requested before {path} could be processed")]
    Interrupted { path: PathBuf },

    #[error("failed to replace {source_path} with {intermediate_path}: {reason}")]
    ReplaceFailed {
        source_path: PathBuf,
        intermediate_path: PathBuf,
        reason: String,
    },

    #[error("queue state unreadable or unwritable: {reason}")]
    QueueIo { reason: String },

    #[error("perceptual hash failed for {path}: {reason}")]
    HashFailed { path: PathBuf, reason: String },

    #[error("required external tool not found: {0}")]
    ToolNotFound(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    /// Infrastructure errors abort the whole batch; everything else is
    /// contained to the file that produced it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::QueueIo { .. } | EngineError::ToolNotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
