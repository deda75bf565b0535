//! Error types for quantizer operations.
//!
//! Every caller precondition the engine can check (input dimensions, code
//! ranges, merge parity) is reported through [`QuantizerError`] rather than
//! silently wrapped or truncated.

use thiserror::Error;

/// Result type alias using [`QuantizerError`].
pub type Result<T> = std::result::Result<T, QuantizerError>;

/// Errors that can occur during quantizer operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QuantizerError {
    /// Trailing dimension of an input does not match the quantizer dimension.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Expected vector dimension.
        expected: usize,
        /// Actual trailing dimension provided.
        actual: usize,
    },

    /// Trailing dimension of a code array does not match the codebook count.
    #[error("code length mismatch: expected {expected} codes per frame, got {actual}")]
    CodeLengthMismatch {
        /// Number of codebooks.
        expected: usize,
        /// Actual trailing dimension provided.
        actual: usize,
    },

    /// A code index lies outside `[0, codebook_size)`.
    #[error("code out of range: codebook {codebook} has index {index}, codebook size is {codebook_size}")]
    CodeOutOfRange {
        /// Codebook the offending index belongs to.
        codebook: usize,
        /// The offending index.
        index: u32,
        /// Number of centers per codebook.
        codebook_size: usize,
    },

    /// Product merge requires an even number of codebooks.
    #[error("cannot merge codebooks pairwise: num_codebooks {0} is odd")]
    OddCodebookCount(usize),

    /// Declared shape does not describe the supplied data.
    #[error("shape mismatch: shape describes {expected} elements, got {actual}")]
    ShapeMismatch {
        /// Element count implied by the shape.
        expected: usize,
        /// Number of elements supplied.
        actual: usize,
    },

    /// Operation requires at least one frame.
    #[error("empty batch: operation requires at least one frame")]
    EmptyBatch,

    /// Invalid parameter value provided.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Optimizer state was created for a different number of parameters.
    #[error("parameter count mismatch: optimizer tracks {expected} parameters, got {actual}")]
    ParameterCountMismatch {
        /// Parameter count the optimizer was built for.
        expected: usize,
        /// Parameter count of the bank or gradient supplied.
        actual: usize,
    },
}

impl QuantizerError {
    /// Creates a new `DimensionMismatch` error.
    pub fn dimension_mismatch(expected: usize, actual: usize) -> Self {
        Self::DimensionMismatch { expected, actual }
    }

    /// Creates a new `CodeLengthMismatch` error.
    pub fn code_length_mismatch(expected: usize, actual: usize) -> Self {
        Self::CodeLengthMismatch { expected, actual }
    }

    /// Creates a new `CodeOutOfRange` error.
    pub fn code_out_of_range(codebook: usize, index: u32, codebook_size: usize) -> Self {
        Self::CodeOutOfRange {
            codebook,
            index,
            codebook_size,
        }
    }

    /// Creates a new `ShapeMismatch` error.
    pub fn shape_mismatch(expected: usize, actual: usize) -> Self {
        Self::ShapeMismatch { expected, actual }
    }

    /// Creates a new `InvalidParameter` error.
    pub fn invalid_parameter(msg: impl Into<String>) -> Self {
        Self::InvalidParameter(msg.into())
    }

    /// Creates a new `ParameterCountMismatch` error.
    pub fn parameter_count_mismatch(expected: usize, actual: usize) -> Self {
        Self::ParameterCountMismatch { expected, actual }
    }
}
