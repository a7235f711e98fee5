//! Error types for `kbroker` core library.

use thiserror::Error;

/// Result type alias using `kbroker` Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for `kbroker` operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Buffer too short to carry a message header
    #[error("Malformed message: {len} bytes, header needs {required}")]
    MalformedMessage { len: usize, required: usize },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}
