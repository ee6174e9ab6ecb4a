//! Common error types for reconflow

use thiserror::Error;

/// Common result type for reconflow operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across the reconflow crates
#[derive(Error, Debug)]
pub enum Error {
    /// Study (or study alias) is not defined in the configuration
    #[error("Study not found: {0}")]
    StudyNotFound(String),

    /// Subject identifier does not match the identifier grammar
    #[error("Malformed subject identifier: {0}")]
    MalformedIdentifier(String),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Requested configuration entry not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Config file is not valid TOML for the expected shape
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}
