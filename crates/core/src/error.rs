//! Typed failures surfaced by the inference engine.

use std::path::PathBuf;

use thiserror::Error;

pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Weight data is malformed or its declared shapes are inconsistent.
    #[error("malformed model data: {0}")]
    Format(String),

    #[error("model file not readable: {}", path.display())]
    NotFound {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("backend '{backend}' unavailable: {reason}")]
    BackendUnavailable { backend: String, reason: String },

    /// Processed tiles do not cover the output plane exactly once.
    #[error("tile coverage incomplete: {0}")]
    IncompleteCoverage(String),

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("failed to write {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl EngineError {
    pub(crate) fn format(detail: impl Into<String>) -> Self {
        Self::Format(detail.into())
    }

    pub(crate) fn shape(detail: impl Into<String>) -> Self {
        Self::ShapeMismatch(detail.into())
    }
}
