//! Error types for the traffic-gnn crate.

use std::path::PathBuf;
use thiserror::Error;

/// All errors that can occur in traffic-gnn operations.
#[derive(Error, Debug)]
pub enum GnnError {
    /// Tensor operation failed.
    #[error("tensor operation failed: {0}")]
    Candle(#[from] candle_core::Error),

    /// I/O error while reading data or writing artifacts.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid or inconsistent hyperparameter record.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Malformed or inconsistent preprocessed data.
    #[error("invalid data: {0}")]
    Data(String),

    /// No weight file with an `epoch<N>-` tag was found.
    #[error("no checkpoint matching 'epoch<N>-' found in {dir}")]
    CheckpointNotFound {
        /// Directory that was scanned.
        dir: PathBuf,
    },

    /// The training loss left the finite range. Not recoverable.
    #[error("non-finite training loss at epoch {epoch}, step {step}")]
    NonFiniteLoss {
        /// Epoch (1-based) where the loss diverged.
        epoch: usize,
        /// Step within the epoch.
        step: usize,
    },

    /// Other training failure.
    #[error("training failed: {0}")]
    Training(String),
}

/// Result type alias for traffic-gnn operations.
pub type GnnResult<T> = Result<T, GnnError>;

impl GnnError {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a data error.
    pub fn data(msg: impl Into<String>) -> Self {
        Self::Data(msg.into())
    }

    /// Create a training error.
    pub fn training(msg: impl Into<String>) -> Self {
        Self::Training(msg.into())
    }
}
