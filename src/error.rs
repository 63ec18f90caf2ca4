//! pagedattn error types

use crate::tensor::DType;

/// pagedattn result type
pub type Result<T> = std::result::Result<T, Error>;

/// pagedattn errors
///
/// Every variant terminates the current call or construction; nothing is
/// retried internally. Retry policy belongs to the host.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Operand list length violates the operator contract (13 or 14)
    #[error("invalid operand count: expected 13 or 14, got {got}")]
    InvalidOperandCount {
        /// Number of operands actually supplied
        got: usize,
    },

    /// Dimension assertion failed during layout inspection or write preprocessing
    #[error("shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch {
        /// Expected shape, `?` marking wildcard axes
        expected: String,
        /// Actual shape
        actual: String,
    },

    /// No attention execution plan exists for the resolved precision
    #[error("attention executor creation fails with precision {precision}")]
    PlanConstructionFailure {
        /// The compute precision that could not be served
        precision: DType,
    },

    /// Operand type does not match the expected operator contract
    #[error("unsupported operation: {reason}")]
    UnsupportedOperation {
        /// Why construction was rejected
        reason: String,
    },
}
