//! SASL frame bodies.

use bytes::Bytes;

use crate::codes;
use crate::convert::{descriptor_code, Composite, FieldReader, FromValue};
use crate::error::{CodecError, Result};
use crate::value::{Symbol, Value};

/// Mechanisms offered by the server.
#[derive(Debug, Clone, PartialEq)]
pub struct SaslMechanisms {
    /// Supported mechanism names in order of preference.
    pub mechanisms: Vec<Symbol>,
}

impl Composite for SaslMechanisms {
    const CODE: u64 = codes::SASL_MECHANISMS;
    const NAME: &'static str = "amqp:sasl-mechanisms:list";

    fn fields(&self) -> Vec<Value> {
        vec![self.mechanisms.clone().into()]
    }

    fn from_fields(fields: &mut FieldReader) -> Result<Self> {
        Ok(Self {
            mechanisms: fields.required("sasl-server-mechanisms")?,
        })
    }
}

/// The client's mechanism choice and initial response.
#[derive(Debug, Clone, PartialEq)]
pub struct SaslInit {
    /// Selected mechanism.
    pub mechanism: Symbol,
    /// Initial response data.
    pub initial_response: Option<Bytes>,
    /// Name of the target host.
    pub hostname: Option<String>,
}

impl Composite for SaslInit {
    const CODE: u64 = codes::SASL_INIT;
    const NAME: &'static str = "amqp:sasl-init:list";

    fn fields(&self) -> Vec<Value> {
        vec![
            Value::Symbol(self.mechanism.clone()),
            self.initial_response.clone().into(),
            self.hostname.clone().into(),
        ]
    }

    fn from_fields(fields: &mut FieldReader) -> Result<Self> {
        Ok(Self {
            mechanism: fields.required("mechanism")?,
            initial_response: fields.optional()?,
            hostname: fields.optional()?,
        })
    }
}

/// Security challenge data.
#[derive(Debug, Clone, PartialEq)]
pub struct SaslChallenge {
    /// Challenge bytes.
    pub challenge: Bytes,
}

impl Composite for SaslChallenge {
    const CODE: u64 = codes::SASL_CHALLENGE;
    const NAME: &'static str = "amqp:sasl-challenge:list";

    fn fields(&self) -> Vec<Value> {
        vec![Value::Binary(self.challenge.clone())]
    }

    fn from_fields(fields: &mut FieldReader) -> Result<Self> {
        Ok(Self {
            challenge: fields.required("challenge")?,
        })
    }
}

/// Security response data.
#[derive(Debug, Clone, PartialEq)]
pub struct SaslResponse {
    /// Response bytes.
    pub response: Bytes,
}

impl Composite for SaslResponse {
    const CODE: u64 = codes::SASL_RESPONSE;
    const NAME: &'static str = "amqp:sasl-response:list";

    fn fields(&self) -> Vec<Value> {
        vec![Value::Binary(self.response.clone())]
    }

    fn from_fields(fields: &mut FieldReader) -> Result<Self> {
        Ok(Self {
            response: fields.required("response")?,
        })
    }
}

/// Result code of a SASL exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaslCode {
    /// Authentication succeeded.
    Ok,
    /// Authentication failed because of bad credentials.
    Auth,
    /// Unspecified system error.
    Sys,
    /// Unrecoverable system error.
    SysPerm,
    /// Transient system error.
    SysTemp,
}

impl From<SaslCode> for Value {
    fn from(code: SaslCode) -> Self {
        Value::Ubyte(match code {
            SaslCode::Ok => 0,
            SaslCode::Auth => 1,
            SaslCode::Sys => 2,
            SaslCode::SysPerm => 3,
            SaslCode::SysTemp => 4,
        })
    }
}

impl FromValue for SaslCode {
    fn from_value(value: Value) -> Result<Self> {
        Ok(match u8::from_value(value)? {
            0 => SaslCode::Ok,
            1 => SaslCode::Auth,
            3 => SaslCode::SysPerm,
            4 => SaslCode::SysTemp,
            _ => SaslCode::Sys,
        })
    }
}

/// Outcome of the SASL exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct SaslOutcome {
    /// Result code.
    pub code: SaslCode,
    /// Additional data for the client.
    pub additional_data: Option<Bytes>,
}

impl Composite for SaslOutcome {
    const CODE: u64 = codes::SASL_OUTCOME;
    const NAME: &'static str = "amqp:sasl-outcome:list";

    fn fields(&self) -> Vec<Value> {
        vec![self.code.into(), self.additional_data.clone().into()]
    }

    fn from_fields(fields: &mut FieldReader) -> Result<Self> {
        Ok(Self {
            code: fields.required("code")?,
            additional_data: fields.optional()?,
        })
    }
}

/// Body of a SASL frame.
#[derive(Debug, Clone, PartialEq)]
pub enum SaslFrame {
    /// `sasl-mechanisms`
    Mechanisms(SaslMechanisms),
    /// `sasl-init`
    Init(SaslInit),
    /// `sasl-challenge`
    Challenge(SaslChallenge),
    /// `sasl-response`
    Response(SaslResponse),
    /// `sasl-outcome`
    Outcome(SaslOutcome),
}

impl SaslFrame {
    /// The described value of the body.
    pub fn to_value(&self) -> Value {
        match self {
            SaslFrame::Mechanisms(b) => b.to_value(),
            SaslFrame::Init(b) => b.to_value(),
            SaslFrame::Challenge(b) => b.to_value(),
            SaslFrame::Response(b) => b.to_value(),
            SaslFrame::Outcome(b) => b.to_value(),
        }
    }

    /// Converts a decoded SASL frame body.
    pub fn from_value(value: Value) -> Result<Self> {
        let code = match &value {
            Value::Described(descriptor, _) => descriptor_code(descriptor),
            other => {
                return Err(CodecError::TypeMismatch {
                    expected: "sasl frame body",
                    found: other.type_name(),
                })
            }
        };
        Ok(match code {
            Some(codes::SASL_MECHANISMS) => {
                SaslFrame::Mechanisms(SaslMechanisms::from_described(value)?)
            }
            Some(codes::SASL_INIT) => SaslFrame::Init(SaslInit::from_described(value)?),
            Some(codes::SASL_CHALLENGE) => {
                SaslFrame::Challenge(SaslChallenge::from_described(value)?)
            }
            Some(codes::SASL_RESPONSE) => SaslFrame::Response(SaslResponse::from_described(value)?),
            Some(codes::SASL_OUTCOME) => SaslFrame::Outcome(SaslOutcome::from_described(value)?),
            _ => return Err(CodecError::UnknownDescriptor(format!("{:?}", value))),
        })
    }
}
