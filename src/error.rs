//! Error type shared by every fallible operation in the crate.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, LossError>;

#[derive(Error, Debug)]
pub enum LossError {
    #[error("Shape mismatch in '{operation}': expected {expected}, got {got}")]
    ShapeMismatch {
        operation: String,
        expected: String,
        got: String,
    },

    /// A width or height that cannot go through the square root.
    #[error("Invalid box dimension in '{operation}': value {value} at row {row} (must be finite and >= 0)")]
    NegativeDimension {
        operation: String,
        row: usize,
        value: f32,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to parse configuration: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LossError {
    pub fn shape_mismatch(
        operation: impl Into<String>,
        expected: impl Into<String>,
        got: impl Into<String>,
    ) -> Self {
        LossError::ShapeMismatch {
            operation: operation.into(),
            expected: expected.into(),
            got: got.into(),
        }
    }
}
