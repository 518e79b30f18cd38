//! Error types for the listener engine and container host.

use amqphost_transport::TransportError;
use amqphost_types::{condition, CodecError, Error};
use thiserror::Error;

/// Errors raised by the listener, its connections and the container host.
#[derive(Debug, Error)]
pub enum AmqpError {
    /// A failure carrying an AMQP error condition, sent to the peer as is.
    #[error("{condition}: {description}")]
    Amqp {
        /// Symbolic condition such as `amqp:not-found`.
        condition: String,
        /// Human readable description.
        description: String,
    },

    /// Byte transport failure.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Frame or message decoding failure.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Malformed listener address.
    #[error("invalid address {address}: {reason}")]
    InvalidAddress {
        /// The address as given.
        address: String,
        /// What is wrong with it.
        reason: String,
    },

    /// Invalid or incomplete configuration.
    #[error("configuration error: {reason}")]
    Config {
        /// What is wrong.
        reason: String,
    },

    /// The link, session or connection has been closed.
    #[error("{0} is closed")]
    Closed(&'static str),

    /// A wait did not complete in time.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// Filesystem or socket failure outside a transport.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl AmqpError {
    /// An error with an explicit AMQP condition.
    pub fn new(condition: &str, description: impl Into<String>) -> Self {
        AmqpError::Amqp {
            condition: condition.to_string(),
            description: description.into(),
        }
    }

    /// `amqp:not-found`.
    pub fn not_found(description: impl Into<String>) -> Self {
        Self::new(condition::NOT_FOUND, description)
    }

    /// `amqp:not-allowed`.
    pub fn not_allowed(description: impl Into<String>) -> Self {
        Self::new(condition::NOT_ALLOWED, description)
    }

    /// `amqp:not-implemented`.
    pub fn not_implemented(description: impl Into<String>) -> Self {
        Self::new(condition::NOT_IMPLEMENTED, description)
    }

    /// `amqp:internal-error`.
    pub fn internal(description: impl Into<String>) -> Self {
        Self::new(condition::INTERNAL_ERROR, description)
    }

    /// The AMQP condition this error maps to on the wire.
    pub fn condition(&self) -> &str {
        match self {
            AmqpError::Amqp { condition, .. } => condition,
            AmqpError::Codec(_) => condition::DECODE_ERROR,
            AmqpError::Closed(_) => condition::ILLEGAL_STATE,
            AmqpError::InvalidAddress { .. } => condition::INVALID_FIELD,
            _ => condition::INTERNAL_ERROR,
        }
    }

    /// The wire error sent to a peer for this failure.
    pub fn to_error(&self) -> Error {
        match self {
            AmqpError::Amqp {
                condition,
                description,
            } => Error::new(condition.as_str(), description.as_str()),
            other => Error::new(other.condition(), other.to_string()),
        }
    }
}

impl From<AmqpError> for Error {
    fn from(error: AmqpError) -> Self {
        error.to_error()
    }
}

impl From<Error> for AmqpError {
    fn from(error: Error) -> Self {
        AmqpError::Amqp {
            condition: error.condition.as_str().to_string(),
            description: error.description.unwrap_or_default(),
        }
    }
}

/// Result type for listener operations.
pub type Result<T> = std::result::Result<T, AmqpError>;
