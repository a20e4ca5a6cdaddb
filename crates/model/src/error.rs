//! Model error types

use thiserror::Error;

use meshlm_core::CoreError;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Core error: {0}")]
    Core(#[from] CoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Safetensors error: {0}")]
    Safetensors(String),

    #[error("Missing weight: {0}")]
    MissingWeight(String),

    #[error("Invalid shape for {name}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Batch of {got} prompts exceeds max_batch_size {max}")]
    BatchTooLarge { max: usize, got: usize },

    #[error("Prompt of {got} tokens exceeds max_seq_len {max}")]
    ContextLengthExceeded { max: usize, got: usize },

    #[error("Invalid dialog: {0}")]
    InvalidDialog(String),
}

pub type Result<T> = std::result::Result<T, ModelError>;
