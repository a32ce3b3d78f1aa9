//! Error types for the duplex engine

use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the engine
#[derive(Debug, Error)]
pub enum Error {
    /// No API key was configured
    #[error("API key is missing, set the {0} environment variable")]
    MissingCredential(String),

    /// Audio device could not be opened or driven
    #[error("audio device error: {0}")]
    Device(String),

    /// Remote session could not be opened
    #[error("transport error: {0}")]
    Transport(String),

    /// Inbound payload could not be turned into audio
    #[error("invalid payload: {0}")]
    Payload(String),

    /// Outbound frame was not accepted by the session
    #[error("session is not accepting audio: {0}")]
    Send(&'static str),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Transport text encoding error
    #[error("base64 error: {0}")]
    Base64(#[from] base64::DecodeError),
}
