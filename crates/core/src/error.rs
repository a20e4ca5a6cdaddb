//! Core error types

use thiserror::Error;

/// Core result type
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core error types
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Mesh error: {0}")]
    Mesh(String),

    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("Unsupported data type: {0}")]
    UnsupportedDtype(String),

    #[error("Collective error: {0}")]
    Collective(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Whether the error comes from user-supplied configuration
    pub fn is_config_error(&self) -> bool {
        matches!(self, CoreError::InvalidConfig(_) | CoreError::Mesh(_))
    }
}
