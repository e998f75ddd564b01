//! Error handling for CAN Assure
//!
//! This module defines the library error type and a Result alias for use
//! throughout the engine and its collaborators.

use std::time::Duration;
use thiserror::Error;

/// Main error type for CAN Assure operations
#[derive(Error, Debug)]
pub enum CanAssureError {
    /// Errors related to configuration loading/saving
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors related to the frame/signal catalog
    #[error("Catalog error: {0}")]
    Catalog(String),

    /// A frame could not be encoded from its signal values
    #[error("Encode error for frame {frame}: {message}")]
    Encode { frame: String, message: String },

    /// The bus rejected a frame
    #[error("Transmit error: {0}")]
    Transmit(String),

    /// Errors reported by the device bridge
    #[error("Device bridge error: {0}")]
    Bridge(String),

    /// The device bridge did not answer in time
    #[error("Device bridge timed out after {0:?}")]
    BridgeTimeout(Duration),

    /// Errors related to the vector store
    #[error("Vector store error: {0}")]
    VectorStore(String),

    /// Errors while parsing text input
    #[error("Parse error: {0}")]
    Parse(String),

    /// The bus interface is not up
    #[error("Link down: {0}")]
    LinkDown(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<CanAssureError>,
    },
}

impl CanAssureError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        CanAssureError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Create an encode error for a frame
    pub fn encode(frame: impl Into<String>, message: impl Into<String>) -> Self {
        CanAssureError::Encode {
            frame: frame.into(),
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for CanAssureError {
    fn from(err: serde_json::Error) -> Self {
        CanAssureError::Serialization(err.to_string())
    }
}

/// Result type alias for CAN Assure operations
pub type Result<T> = std::result::Result<T, CanAssureError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}
