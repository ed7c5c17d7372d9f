//! Error type for every entity-linker failure.
//!
//! # Error Categories
//!
//! | Category | Variants | Recovery Strategy |
//! |----------|----------|-------------------|
//! | Configuration | ConfigError, UnknownPooling | Fix configuration |
//! | Model files | ModelDirectoryNotFound, CheckpointNotFound, ModelConfigError, CheckpointReadError | Fix paths / files |
//! | Weight merge | ShapeMismatch | Fix checkpoint or architecture |
//! | Contract | PreconditionViolation, CandidateSetMismatch, RankInvariant | Fix the caller (bug) |
//! | Infrastructure | TensorError, IoError, InternalError | Abort the step |
//! | Serialization | SerializationError | Fix data format |
//!
//! Missing or unexpected checkpoint keys are NOT errors: the merge is
//! tolerant and reports them through [`crate::checkpoint::MergeReport`].

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinkerError {
    // === Configuration Errors ===
    /// Configuration file invalid or a value out of range.
    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    /// Pooling mode name not one of cls, max, mean.
    #[error("Unknown pooling mode: {mode} (supported: cls, max, mean)")]
    UnknownPooling { mode: String },

    // === Model File Errors ===
    /// Pretrained model directory does not exist.
    #[error("Model directory not found: {path}")]
    ModelDirectoryNotFound { path: String },

    /// Neither model.safetensors nor pytorch_model.bin present.
    #[error("Checkpoint not found: {path}")]
    CheckpointNotFound { path: String },

    /// config.json missing or malformed.
    #[error("Model config error for {path}: {message}")]
    ModelConfigError { path: String, message: String },

    /// Checkpoint file present but unreadable.
    #[error("Failed to read checkpoint {path}: {message}")]
    CheckpointReadError { path: String, message: String },

    // === Weight Merge Errors ===
    /// A checkpoint tensor matched a parameter name with a different shape.
    #[error("Shape mismatch for {name}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    // === Contract Errors ===
    /// Caller breached a documented precondition.
    #[error("Precondition violated: {message}")]
    PreconditionViolation { message: String },

    /// Candidate sets must all have the same cardinality and one per sample.
    #[error("Candidate set {index}: expected {expected} rows, got {actual}")]
    CandidateSetMismatch {
        index: usize,
        expected: usize,
        actual: usize,
    },

    /// The gold label of a row could not be located exactly once.
    #[error("Rank lookup invariant broken at row {row}: label {label} among {num_candidates} candidates")]
    RankInvariant {
        row: usize,
        label: i64,
        num_candidates: usize,
    },

    // === Infrastructure Errors ===
    /// Candle tensor operation failed.
    #[error("Tensor operation failed for {operation}: {message}")]
    TensorError { operation: String, message: String },

    /// File I/O error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Internal error (should not occur in normal operation).
    #[error("Internal error: {message}")]
    InternalError { message: String },

    // === Serialization Errors ===
    #[error("Serialization error: {message}")]
    SerializationError { message: String },
}

impl From<candle_core::Error> for LinkerError {
    fn from(err: candle_core::Error) -> Self {
        LinkerError::TensorError {
            operation: "candle".to_string(),
            message: err.to_string(),
        }
    }
}

/// Result type alias for entity-linker operations.
pub type LinkerResult<T> = Result<T, LinkerError>;

/// Attach an operation name to a candle error.
pub(crate) fn tensor_op(operation: &'static str) -> impl FnOnce(candle_core::Error) -> LinkerError {
    move |e| LinkerError::TensorError {
        operation: operation.to_string(),
        message: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_pooling_names_supported_modes() {
        let err = LinkerError::UnknownPooling {
            mode: "sum".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("sum"));
        assert!(msg.contains("cls, max, mean"));
    }

    #[test]
    fn test_shape_mismatch_shows_both_shapes() {
        let err = LinkerError::ShapeMismatch {
            name: "embeddings.word_embeddings.weight".to_string(),
            expected: vec![30522, 768],
            actual: vec![30000, 768],
        };
        let msg = err.to_string();
        assert!(msg.contains("word_embeddings"));
        assert!(msg.contains("30522"));
        assert!(msg.contains("30000"));
    }

    #[test]
    fn test_candle_error_converts_via_question_mark() {
        fn fallible() -> LinkerResult<()> {
            let t = candle_core::Tensor::zeros((2, 3), candle_core::DType::F32, &candle_core::Device::Cpu)?;
            let _ = t.reshape((4, 4))?;
            Ok(())
        }
        assert!(matches!(fallible(), Err(LinkerError::TensorError { .. })));
    }

    #[test]
    fn test_tensor_op_attaches_operation_name() {
        let err = candle_core::Tensor::zeros(3, candle_core::DType::F32, &candle_core::Device::Cpu)
            .and_then(|t| t.reshape((2, 2)))
            .map_err(tensor_op("reshape logits"))
            .unwrap_err();
        match err {
            LinkerError::TensorError { operation, .. } => assert_eq!(operation, "reshape logits"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_io_error_conversion_via_question_mark() {
        fn fallible_io() -> LinkerResult<()> {
            let _ = std::fs::read("/nonexistent/path/that/does/not/exist/linker")?;
            Ok(())
        }
        assert!(matches!(fallible_io(), Err(LinkerError::IoError(_))));
    }

    #[test]
    fn test_linker_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<LinkerError>();
    }
}
