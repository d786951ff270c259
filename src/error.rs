//! Error types for all collector operations.

use thiserror::Error;

/// Main error type for collector operations.
///
/// Only conditions the embedding can react to are surfaced as errors.
/// Detected heap corruption is never an error value: it indicates a bug in
/// the collector or in a runtime callback and aborts with a diagnostic dump.
#[derive(Debug, Error)]
pub enum GcError {
    #[error("out of memory: requested {requested} bytes, available {available} bytes")]
    OutOfMemory { requested: usize, available: usize },

    #[error("heap initialization failed: {0}")]
    HeapInitialization(String),

    #[error("virtual memory error: {0}")]
    VirtualMemory(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("calling thread is not registered with the collector")]
    ThreadNotRegistered,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Result type alias for collector operations.
pub type Result<T> = std::result::Result<T, GcError>;
