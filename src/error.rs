//! Error types
//!
//! Every fallible operation in the crate returns [`Result`]. The variants
//! mirror the three failure classes of the training system:
//!
//! - **Configuration**: the hyperparameters cannot describe a valid model
//!   (e.g. `n_embd` not divisible by `n_head`, missing `vocab_size`)
//! - **Validation**: a call was made with arguments the model cannot accept
//!   (e.g. a sequence longer than the context window)
//! - **Io / Checkpoint / Json**: missing data files, unreadable or mismatched
//!   checkpoints
//!
//! Numeric failures (NaN loss, exploding activations) are not represented
//! here. The training loop does not try to recover from them.

use thiserror::Error;

/// Errors produced by model construction, training, and checkpoint I/O
#[derive(Debug, Error)]
pub enum GptError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for model and training operations
pub type Result<T> = std::result::Result<T, GptError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GptError::Configuration("n_embd must be divisible by n_head".to_string());
        assert!(format!("{}", err).contains("configuration error"));
        assert!(format!("{}", err).contains("n_head"));

        let err = GptError::Validation("sequence too long".to_string());
        assert!(format!("{}", err).contains("validation error"));

        let err = GptError::Checkpoint("shape mismatch".to_string());
        assert!(format!("{}", err).contains("shape mismatch"));
    }

    #[test]
    fn test_io_error_converts() {
        fn open_missing() -> Result<std::fs::File> {
            Ok(std::fs::File::open("/definitely/not/a/real/path.bin")?)
        }

        match open_missing() {
            Err(GptError::Io(e)) => assert_eq!(e.kind(), std::io::ErrorKind::NotFound),
            other => panic!("expected Io error, got {:?}", other),
        }
    }
}
