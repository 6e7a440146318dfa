//! Top-level error types for agent-memory.

use std::path::PathBuf;
use std::sync::Arc;

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// The memory error behind this error, if any.
    pub fn as_memory(&self) -> Option<&MemoryError> {
        match self {
            Error::Memory(error) => Some(error),
            _ => None,
        }
    }
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load config from {path}: {source}")]
    Load {
        path: String,
        source: Arc<std::io::Error>,
    },

    #[error("failed to parse config {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Memory storage and retrieval errors.
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("memory not found: {id}")]
    NotFound { id: u64 },

    #[error("failed to generate embedding: {0}")]
    EmbeddingFailed(String),

    #[error("failed to persist memory to {}: {reason}", .path.display())]
    PersistenceFailed { path: PathBuf, reason: String },

    #[error("persisted memory at {} is corrupt: {reason}", .path.display())]
    Corrupt { path: PathBuf, reason: String },

    #[error("store was written with embedding model {stored}, active model is {active}")]
    IncompatibleModel { stored: String, active: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("store is running in memory only; writes are not persisted")]
    NotPersistent,
}

impl MemoryError {
    pub(crate) fn persistence(path: impl Into<PathBuf>, reason: impl std::fmt::Display) -> Self {
        MemoryError::PersistenceFailed {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl std::fmt::Display) -> Self {
        MemoryError::Corrupt {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}
