use thiserror::Error;

/// Errors raised while encoding or decoding AMQP data.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CodecError {
    #[error("unexpected end of buffer: needed {needed} more bytes")]
    UnexpectedEof { needed: usize },

    #[error("invalid format code: 0x{0:02X}")]
    InvalidFormatCode(u8),

    #[error("invalid utf-8 in {context}")]
    InvalidUtf8 { context: &'static str },

    #[error("expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    #[error("missing mandatory field {0}")]
    MissingField(&'static str),

    #[error("unknown descriptor {0}")]
    UnknownDescriptor(String),

    #[error("invalid frame: {reason}")]
    InvalidFrame { reason: String },

    #[error("invalid protocol header: {0:02X?}")]
    InvalidProtocolHeader([u8; 8]),
}

pub type Result<T> = std::result::Result<T, CodecError>;
