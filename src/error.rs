//! Error types for Deadbrick.

use thiserror::Error;

/// Main error type for Deadbrick operations.
///
/// Faults and refusals are not errors; they are admission state.
#[derive(Error, Debug)]
pub enum DeadbrickError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Deadbrick operations.
pub type Result<T> = std::result::Result<T, DeadbrickError>;
