//! Error types for nodeflow.

use thiserror::Error;

use crate::mode::{AdjacencyKind, Mode};

/// Error type for graph layer construction and evaluation.
#[derive(Debug, Error)]
pub enum Error {
    /// Feature, adjacency or parameter shapes disagree.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// The layer does not implement the requested adjacency representation.
    #[error("{layer} does not support {kind} adjacency ({mode} mode)")]
    UnsupportedMode {
        layer: &'static str,
        kind: AdjacencyKind,
        mode: Mode,
    },

    /// Mutually inconsistent or out-of-range constructor options.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Candle tensor error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Shorthand for [`Error::ShapeMismatch`].
    pub fn shape(msg: impl Into<String>) -> Self {
        Self::ShapeMismatch(msg.into())
    }

    /// Shorthand for [`Error::InvalidConfig`].
    pub fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
