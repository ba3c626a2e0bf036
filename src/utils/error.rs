//! Error Handling Module
//!
//! Defines the error taxonomy for the waste sorting pipeline.
//! Uses thiserror for ergonomic error definitions.

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for waste sorter operations
#[derive(Error, Debug)]
pub enum WasteSorterError {
    /// Partition sizes, model shape or checkpoint mismatch. Fatal at startup.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A missing or undecodable image. `position` is set once the error
    /// has passed through a training or evaluation pass.
    #[error("Data error at '{}': {reason}", path.display())]
    Data {
        path: PathBuf,
        reason: String,
        position: Option<BatchPosition>,
    },

    /// Numeric or data failure inside a training/evaluation pass
    #[error("Training error at epoch {epoch}, batch {batch}: {reason}")]
    Training {
        epoch: usize,
        batch: usize,
        reason: String,
    },

    /// Unexpected failure during single-image prediction
    #[error("Inference error: {0}")]
    Inference(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Epoch and batch index of a failure inside a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPosition {
    pub epoch: usize,
    pub batch: usize,
}

/// Coarse error tag that callers branch on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Data,
    Training,
    Inference,
    Io,
    Serialization,
}

impl WasteSorterError {
    /// Shorthand for a data error on a path
    pub fn data(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        WasteSorterError::Data {
            path: path.into(),
            reason: reason.into(),
            position: None,
        }
    }

    /// Tag of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            WasteSorterError::Configuration(_) => ErrorKind::Configuration,
            WasteSorterError::Data { .. } => ErrorKind::Data,
            WasteSorterError::Training { .. } => ErrorKind::Training,
            WasteSorterError::Inference(_) => ErrorKind::Inference,
            WasteSorterError::Io(_) => ErrorKind::Io,
            WasteSorterError::Serialization(_) => ErrorKind::Serialization,
        }
    }

    /// Attach the epoch and batch position to a failure raised inside a pass.
    ///
    /// Data errors keep their kind so the caller can still tell a corrupt
    /// image from a numeric failure.
    pub fn at_batch(self, epoch: usize, batch: usize) -> Self {
        match self {
            WasteSorterError::Data { path, reason, .. } => WasteSorterError::Data {
                path,
                reason: format!("{} (epoch {}, batch {})", reason, epoch, batch),
                position: Some(BatchPosition { epoch, batch }),
            },
            WasteSorterError::Training { reason, .. } => WasteSorterError::Training {
                epoch,
                batch,
                reason,
            },
            other => WasteSorterError::Training {
                epoch,
                batch,
                reason: other.to_string(),
            },
        }
    }

    /// Where in a pass the failure happened, if it happened inside one
    pub fn batch_position(&self) -> Option<BatchPosition> {
        match self {
            WasteSorterError::Data { position, .. } => *position,
            WasteSorterError::Training { epoch, batch, .. } => Some(BatchPosition {
                epoch: *epoch,
                batch: *batch,
            }),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for WasteSorterError {
    fn from(err: serde_json::Error) -> Self {
        WasteSorterError::Serialization(err.to_string())
    }
}

/// Convenience Result type for waste sorter operations
pub type Result<T> = std::result::Result<T, WasteSorterError>;

/// Extension trait for adding context to errors
pub trait ResultExt<T> {
    /// Map any error into a configuration error with context
    fn config_context(self, msg: &str) -> Result<T>;

    /// Map any error into a data error for the given path
    fn data_context(self, path: &std::path::Path) -> Result<T>;
}

impl<T, E: std::fmt::Display> ResultExt<T> for std::result::Result<T, E> {
    fn config_context(self, msg: &str) -> Result<T> {
        self.map_err(|e| WasteSorterError::Configuration(format!("{}: {}", msg, e)))
    }

    fn data_context(self, path: &std::path::Path) -> Result<T> {
        self.map_err(|e| WasteSorterError::data(path, e.to_string()))
    }
}
