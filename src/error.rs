//! Error types for the dense GEMM pipeline
//!
//! Every variant is a configuration or host-contract failure. The pipeline
//! itself never reports errors at runtime: once a kernel is compiled, an
//! invocation either runs to completion or the stream is considered failed.

use thiserror::Error;

/// Result type for configuration and launch operations
pub type GemmResult<T> = Result<T, GemmError>;

/// GEMM configuration and launch errors
#[derive(Debug, Error)]
pub enum GemmError {
    #[error("Unsupported element types: {message}")]
    InvalidDtypes { message: String },

    #[error("Invalid MMA tile shape: {message}")]
    InvalidTileShape { message: String },

    #[error("Invalid cluster shape: {message}")]
    InvalidClusterShape { message: String },

    #[error("Misaligned tensor {tensor}: {message}")]
    Misaligned { tensor: String, message: String },

    #[error("Out-of-bounds tiles are not supported without staged stores: {message}")]
    OutOfBoundsTiles { message: String },

    #[error("On-chip resources exhausted: {message}")]
    ResourceExhausted { message: String },

    #[error("Tensor mismatch: expected {expected}, got {got}")]
    TensorMismatch { expected: String, got: String },

    #[error("Stream failure: {message}")]
    StreamFailure { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl GemmError {
    pub fn dtypes(msg: impl Into<String>) -> Self {
        GemmError::InvalidDtypes { message: msg.into() }
    }

    pub fn tile_shape(msg: impl Into<String>) -> Self {
        GemmError::InvalidTileShape { message: msg.into() }
    }

    pub fn cluster_shape(msg: impl Into<String>) -> Self {
        GemmError::InvalidClusterShape { message: msg.into() }
    }

    pub fn misaligned(tensor: impl Into<String>, msg: impl Into<String>) -> Self {
        GemmError::Misaligned {
            tensor: tensor.into(),
            message: msg.into(),
        }
    }

    pub fn out_of_bounds(msg: impl Into<String>) -> Self {
        GemmError::OutOfBoundsTiles { message: msg.into() }
    }

    pub fn exhausted(msg: impl Into<String>) -> Self {
        GemmError::ResourceExhausted { message: msg.into() }
    }

    pub fn stream(msg: impl Into<String>) -> Self {
        GemmError::StreamFailure { message: msg.into() }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        GemmError::Config { message: msg.into() }
    }

    /// True for errors the feasibility gate reports before launch.
    pub fn is_configuration(&self) -> bool {
        !matches!(
            self,
            GemmError::StreamFailure { .. } | GemmError::TensorMismatch { .. }
        )
    }
}

impl From<std::io::Error> for GemmError {
    fn from(err: std::io::Error) -> Self {
        GemmError::config(err.to_string())
    }
}

impl From<serde_json::Error> for GemmError {
    fn from(err: serde_json::Error) -> Self {
        GemmError::config(err.to_string())
    }
}
