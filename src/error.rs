//! Error types for Ratekeeper.
//!
//! Being over a limit is never an error. These variants cover faults that
//! surface while building or configuring a limiter.

use thiserror::Error;

/// Main error type for Ratekeeper operations.
#[derive(Error, Debug)]
pub enum RateKeeperError {
    /// Configuration errors, including zero capacities and intervals
    #[error("Configuration error: {0}")]
    Config(String),

    /// No async runtime is available to host background work
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// Errors raised while layering configuration sources
    #[error("Configuration source error: {0}")]
    Source(#[from] ::config::ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Ratekeeper operations.
pub type Result<T> = std::result::Result<T, RateKeeperError>;
