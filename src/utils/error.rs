//! Error Handling Module
//!
//! Defines the error type shared by the dataset pipeline, the model builder and
//! the training driver. Uses thiserror for ergonomic error definitions.

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for land-cover training operations
#[derive(Error, Debug)]
pub enum LandcoverError {
    /// Missing or invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file could not be parsed
    #[error("Failed to parse config '{path}': {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// Glob pattern is malformed or matched nothing
    #[error("Dataset error: {0}")]
    Dataset(String),

    /// A record frame or example payload could not be decoded
    #[error("Record decode error in '{path}' (record {index}): {msg}")]
    Decode {
        path: PathBuf,
        index: usize,
        msg: String,
    },

    /// Model construction or artifact problem
    #[error("Model error: {0}")]
    Model(String),

    /// Error raised inside the fit loop
    #[error("Training error: {0}")]
    Training(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Convenience Result type for land-cover training operations
pub type Result<T> = std::result::Result<T, LandcoverError>;

impl From<serde_json::Error> for LandcoverError {
    fn from(e: serde_json::Error) -> Self {
        LandcoverError::Serialization(e.to_string())
    }
}

impl From<burn::record::RecorderError> for LandcoverError {
    fn from(e: burn::record::RecorderError) -> Self {
        LandcoverError::Model(format!("recorder failure: {:?}", e))
    }
}

/// Extension trait for adding context to errors
pub trait ResultExt<T> {
    /// Add context to an error
    fn context(self, msg: &str) -> Result<T>;

    /// Add context with a closure (lazy evaluation)
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T, E: std::error::Error> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, msg: &str) -> Result<T> {
        self.map_err(|e| LandcoverError::InvalidInput(format!("{}: {}", msg, e)))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|e| LandcoverError::InvalidInput(format!("{}: {}", f(), e)))
    }
}

impl<T> ResultExt<T> for Option<T> {
    fn context(self, msg: &str) -> Result<T> {
        self.ok_or_else(|| LandcoverError::InvalidInput(msg.to_string()))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.ok_or_else(|| LandcoverError::InvalidInput(f()))
    }
}
