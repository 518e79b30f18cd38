//! Shared protocol definitions: link roles, settlement modes and errors.

use std::fmt;

use crate::codes;
use crate::convert::{Composite, FieldReader, FromValue};
use crate::error::Result;
use crate::value::{Map, Symbol, Value};

/// Role of a link endpoint. Encoded as a boolean: `false` is sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// The endpoint sends messages.
    Sender,
    /// The endpoint receives messages.
    Receiver,
}

impl Role {
    /// The role the other end of the link plays.
    pub fn opposite(self) -> Role {
        match self {
            Role::Sender => Role::Receiver,
            Role::Receiver => Role::Sender,
        }
    }
}

impl From<Role> for Value {
    fn from(role: Role) -> Self {
        Value::Bool(role == Role::Receiver)
    }
}

impl FromValue for Role {
    fn from_value(value: Value) -> Result<Self> {
        Ok(if bool::from_value(value)? {
            Role::Receiver
        } else {
            Role::Sender
        })
    }
}

/// Settlement policy of a sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SenderSettleMode {
    /// Deliveries are sent unsettled.
    Unsettled,
    /// Deliveries are sent settled.
    Settled,
    /// The sender chooses per delivery.
    #[default]
    Mixed,
}

impl From<SenderSettleMode> for Value {
    fn from(mode: SenderSettleMode) -> Self {
        Value::Ubyte(match mode {
            SenderSettleMode::Unsettled => 0,
            SenderSettleMode::Settled => 1,
            SenderSettleMode::Mixed => 2,
        })
    }
}

impl FromValue for SenderSettleMode {
    fn from_value(value: Value) -> Result<Self> {
        Ok(match u8::from_value(value)? {
            0 => SenderSettleMode::Unsettled,
            1 => SenderSettleMode::Settled,
            _ => SenderSettleMode::Mixed,
        })
    }
}

/// Settlement policy of a receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReceiverSettleMode {
    /// The receiver settles first.
    #[default]
    First,
    /// The receiver settles after the sender does.
    Second,
}

impl From<ReceiverSettleMode> for Value {
    fn from(mode: ReceiverSettleMode) -> Self {
        Value::Ubyte(match mode {
            ReceiverSettleMode::First => 0,
            ReceiverSettleMode::Second => 1,
        })
    }
}

impl FromValue for ReceiverSettleMode {
    fn from_value(value: Value) -> Result<Self> {
        Ok(match u8::from_value(value)? {
            1 => ReceiverSettleMode::Second,
            _ => ReceiverSettleMode::First,
        })
    }
}

/// Error conditions defined by AMQP 1.0.
pub mod condition {
    #![allow(missing_docs)]

    pub const INTERNAL_ERROR: &str = "amqp:internal-error";
    pub const NOT_FOUND: &str = "amqp:not-found";
    pub const UNAUTHORIZED_ACCESS: &str = "amqp:unauthorized-access";
    pub const DECODE_ERROR: &str = "amqp:decode-error";
    pub const RESOURCE_LIMIT_EXCEEDED: &str = "amqp:resource-limit-exceeded";
    pub const NOT_ALLOWED: &str = "amqp:not-allowed";
    pub const INVALID_FIELD: &str = "amqp:invalid-field";
    pub const NOT_IMPLEMENTED: &str = "amqp:not-implemented";
    pub const RESOURCE_LOCKED: &str = "amqp:resource-locked";
    pub const PRECONDITION_FAILED: &str = "amqp:precondition-failed";
    pub const RESOURCE_DELETED: &str = "amqp:resource-deleted";
    pub const ILLEGAL_STATE: &str = "amqp:illegal-state";
    pub const FRAME_SIZE_TOO_SMALL: &str = "amqp:frame-size-too-small";

    pub const CONNECTION_FORCED: &str = "amqp:connection:forced";
    pub const FRAMING_ERROR: &str = "amqp:connection:framing-error";
    pub const CONNECTION_REDIRECT: &str = "amqp:connection:redirect";

    pub const WINDOW_VIOLATION: &str = "amqp:session:window-violation";
    pub const ERRANT_LINK: &str = "amqp:session:errant-link";
    pub const HANDLE_IN_USE: &str = "amqp:session:handle-in-use";
    pub const UNATTACHED_HANDLE: &str = "amqp:session:unattached-handle";

    pub const DETACH_FORCED: &str = "amqp:link:detach-forced";
    pub const TRANSFER_LIMIT_EXCEEDED: &str = "amqp:link:transfer-limit-exceeded";
    pub const MESSAGE_SIZE_EXCEEDED: &str = "amqp:link:message-size-exceeded";
    pub const LINK_REDIRECT: &str = "amqp:link:redirect";
    pub const STOLEN: &str = "amqp:link:stolen";
}

/// An AMQP error carried by `close`, `end`, `detach` and `rejected`.
#[derive(Debug, Clone, PartialEq)]
pub struct Error {
    /// Symbolic condition, see [`condition`].
    pub condition: Symbol,
    /// Human readable description.
    pub description: Option<String>,
    /// Additional information.
    pub info: Option<Map>,
}

impl Error {
    /// Creates an error with a condition and description.
    pub fn new(condition: impl Into<Symbol>, description: impl Into<String>) -> Self {
        Self {
            condition: condition.into(),
            description: Some(description.into()),
            info: None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.description {
            Some(description) => write!(f, "{}: {}", self.condition, description),
            None => write!(f, "{}", self.condition),
        }
    }
}

impl Composite for Error {
    const CODE: u64 = codes::ERROR;
    const NAME: &'static str = "amqp:error:list";

    fn fields(&self) -> Vec<Value> {
        vec![
            Value::Symbol(self.condition.clone()),
            self.description.clone().into(),
            self.info.clone().into(),
        ]
    }

    fn from_fields(fields: &mut FieldReader) -> Result<Self> {
        Ok(Self {
            condition: fields.required("condition")?,
            description: fields.optional()?,
            info: fields.optional()?,
        })
    }
}

impl From<Error> for Value {
    fn from(error: Error) -> Self {
        error.to_value()
    }
}

impl FromValue for Error {
    fn from_value(value: Value) -> Result<Self> {
        Error::from_described(value)
    }
}
