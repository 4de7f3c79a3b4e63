// src/utils/error.rs
use thiserror::Error;

// Define specific error types for different parts of the application
#[derive(Error, Debug)]
pub enum DartError {
    #[error("Network request failed: {0}")]
    Network(#[from] reqwest::Error), // Automatically convert reqwest errors

    #[error("HTTP error: {0}")]
    Http(reqwest::StatusCode), // e.g., 500, 503

    #[error("DART request quota exceeded: {0}")]
    QuotaExceeded(String), // HTTP 429 or quota wording in the response message

    #[error("DART returned status {status}: {message}")]
    Api { status: String, message: String },

    #[error("Malformed registry archive: {0}")]
    Archive(String),

    #[error("Failed to parse DART response: {0}")]
    Parse(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Worker pool closed before the request could start")]
    Cancelled,
}

impl DartError {
    /// A fatal error stops the whole coordinator run; everything else is a
    /// per-key miss.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DartError::QuotaExceeded(_))
    }

    /// Whether a retry of the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            DartError::Network(_) | DartError::Http(_) | DartError::Parse(_) => true,
            DartError::Api { .. } | DartError::Archive(_) => true,
            _ => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error), // Automatically convert IO errors

    #[error("DART interaction failed: {0}")]
    Dart(#[from] DartError), // Automatically convert DART errors

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Data processing failed: {0}")]
    Processing(String),

    #[error("Run stopped: {0}")]
    Stopped(String),
}
