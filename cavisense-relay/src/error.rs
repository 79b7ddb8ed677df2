//! Error types for the relay

use thiserror::Error;

/// Relay error types
///
/// Only ingress-path failures reach an HTTP caller; everything else is
/// logged where it happens and contained to one connection or one message.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    #[error("Snapshot store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("Transport send failure: {0}")]
    TransportSendFailure(String),

    #[error("Deserialization failure: {0}")]
    DeserializationFailure(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl From<cavisense_core::Error> for Error {
    fn from(err: cavisense_core::Error) -> Self {
        use cavisense_core::Error as CoreError;

        match err {
            CoreError::MalformedInput(msg) => Self::MalformedInput(msg),
            CoreError::Serialization(e) => Self::Serialization(e.to_string()),
            CoreError::Deserialization { context } => Self::DeserializationFailure(context),
            CoreError::Config(e) => Self::Configuration(e.to_string()),
        }
    }
}

/// Result type for relay operations
pub type Result<T> = std::result::Result<T, Error>;
