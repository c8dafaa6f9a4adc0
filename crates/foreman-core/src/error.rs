//! Error types for Foreman

use thiserror::Error;

/// Result type alias using Foreman's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Foreman core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Envelope or argument payload could not be decoded
    #[error("corrupt payload: {0}")]
    CorruptPayload(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Task discriminant is not one of the known kinds
    #[error("unknown task [{0}]")]
    UnknownTaskKind(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Configuration(String),

    /// IPC channel to or from a worker failed
    #[error("ipc error: {0}")]
    Ipc(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            Error::Deserialization(err.to_string())
        } else {
            Error::Serialization(err.to_string())
        }
    }
}
