//! Transport error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection timeout after {timeout_ms}ms to {addr}")]
    ConnectionTimeout { addr: String, timeout_ms: u64 },

    #[error("connection reset by peer")]
    ConnectionReset,

    #[error("transport closed")]
    Closed,

    #[error("invalid frame: {reason}")]
    InvalidFrame { reason: String },

    #[error("frame too large: {size} bytes (max {max_size})")]
    FrameTooLarge { size: u32, max_size: u32 },

    #[error("TLS error: {reason}")]
    TlsError { reason: String },

    #[error("WebSocket error: {reason}")]
    WebSocketError { reason: String },

    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

impl TransportError {
    /// Whether the error means the peer went away rather than misbehaved.
    pub fn is_disconnect(&self) -> bool {
        match self {
            TransportError::ConnectionReset | TransportError::Closed => true,
            TransportError::IoError(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
