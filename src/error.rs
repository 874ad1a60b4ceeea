//! Error types shared by every stage of the renormalization pipeline.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RenormError {
    /// I/O errors (missing column files, truncated rows, failed renames)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Attribute file error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid options: unknown regression model, out-of-range thresholds
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Malformed store contents or mismatched vector lengths
    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    /// The intensity regression design was rank deficient; the run cannot continue.
    #[error("Rank-deficient intensity regression for sample {sample}: rank {rank} < {columns} columns")]
    RankDeficient {
        sample: usize,
        rank: usize,
        columns: usize,
    },

    #[error("Linear algebra failure: {0}")]
    Linalg(#[from] ndarray_linalg::error::LinalgError),

    #[error("Sample reader failed: {0}")]
    Producer(String),

    #[error("Output column '{0}' is already closed")]
    WriterClosed(String),
}

pub type Result<T> = std::result::Result<T, RenormError>;

impl RenormError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn invalid_data(message: impl Into<String>) -> Self {
        Self::InvalidData {
            message: message.into(),
        }
    }
}
