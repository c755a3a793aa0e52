//! Error types for the transform/quantization/entropy core

use thiserror::Error;

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Generic codec error
    #[error("Codec error: {0}")]
    Codec(String),

    /// Bitstream conformance violation found while parsing
    #[error("Bitstream conformance violation: {0}")]
    Conformance(String),

    /// Arithmetic decoder ran past the end of its data
    #[error("End of stream")]
    EndOfStream,

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Unsupported feature
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a codec error
    pub fn codec<S: Into<String>>(msg: S) -> Self {
        Error::Codec(msg.into())
    }

    /// Create a conformance error
    pub fn conformance<S: Into<String>>(msg: S) -> Self {
        Error::Conformance(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        Error::InvalidInput(msg.into())
    }

    /// Create an unsupported error
    pub fn unsupported<S: Into<String>>(msg: S) -> Self {
        Error::Unsupported(msg.into())
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }
}

