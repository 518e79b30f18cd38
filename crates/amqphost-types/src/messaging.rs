//! Messaging layer: terminus types, delivery outcomes and the message format.

use bytes::{Bytes, BytesMut};

use crate::codes;
use crate::convert::{descriptor_code, Composite, FieldReader, FromValue};
use crate::definitions::Error;
use crate::error::{CodecError, Result};
use crate::value::{Map, Symbol, Value};

/// Source terminus of a link.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Source {
    /// Node address.
    pub address: Option<String>,
    /// Terminus durability.
    pub durable: Option<u32>,
    /// Expiry policy symbol.
    pub expiry_policy: Option<Symbol>,
    /// Expiry timeout in seconds.
    pub timeout: Option<u32>,
    /// Whether the node is created on demand.
    pub dynamic: Option<bool>,
    /// Properties of a dynamic node.
    pub dynamic_node_properties: Option<Map>,
    /// Distribution mode.
    pub distribution_mode: Option<Symbol>,
    /// Filter set.
    pub filter: Option<Map>,
    /// Default outcome for unsettled deliveries.
    pub default_outcome: Option<Value>,
    /// Supported outcomes.
    pub outcomes: Option<Vec<Symbol>>,
    /// Extension capabilities.
    pub capabilities: Option<Vec<Symbol>>,
}

impl Source {
    /// A source with only an address.
    pub fn with_address(address: impl Into<String>) -> Self {
        Self {
            address: Some(address.into()),
            ..Default::default()
        }
    }
}

impl Composite for Source {
    const CODE: u64 = codes::SOURCE;
    const NAME: &'static str = "amqp:source:list";

    fn fields(&self) -> Vec<Value> {
        vec![
            self.address.clone().into(),
            self.durable.into(),
            self.expiry_policy.clone().into(),
            self.timeout.into(),
            self.dynamic.into(),
            self.dynamic_node_properties.clone().into(),
            self.distribution_mode.clone().into(),
            self.filter.clone().into(),
            self.default_outcome.clone().unwrap_or(Value::Null),
            self.outcomes.clone().into(),
            self.capabilities.clone().into(),
        ]
    }

    fn from_fields(fields: &mut FieldReader) -> Result<Self> {
        Ok(Self {
            address: fields.optional()?,
            durable: fields.optional()?,
            expiry_policy: fields.optional()?,
            timeout: fields.optional()?,
            dynamic: fields.optional()?,
            dynamic_node_properties: fields.optional()?,
            distribution_mode: fields.optional()?,
            filter: fields.optional()?,
            default_outcome: fields.optional()?,
            outcomes: fields.optional()?,
            capabilities: fields.optional()?,
        })
    }
}

/// Target terminus of a link.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Target {
    /// Node address.
    pub address: Option<String>,
    /// Terminus durability.
    pub durable: Option<u32>,
    /// Expiry policy symbol.
    pub expiry_policy: Option<Symbol>,
    /// Expiry timeout in seconds.
    pub timeout: Option<u32>,
    /// Whether the node is created on demand.
    pub dynamic: Option<bool>,
    /// Properties of a dynamic node.
    pub dynamic_node_properties: Option<Map>,
    /// Extension capabilities.
    pub capabilities: Option<Vec<Symbol>>,
}

impl Target {
    /// A target with only an address.
    pub fn with_address(address: impl Into<String>) -> Self {
        Self {
            address: Some(address.into()),
            ..Default::default()
        }
    }
}

impl Composite for Target {
    const CODE: u64 = codes::TARGET;
    const NAME: &'static str = "amqp:target:list";

    fn fields(&self) -> Vec<Value> {
        vec![
            self.address.clone().into(),
            self.durable.into(),
            self.expiry_policy.clone().into(),
            self.timeout.into(),
            self.dynamic.into(),
            self.dynamic_node_properties.clone().into(),
            self.capabilities.clone().into(),
        ]
    }

    fn from_fields(fields: &mut FieldReader) -> Result<Self> {
        Ok(Self {
            address: fields.optional()?,
            durable: fields.optional()?,
            expiry_policy: fields.optional()?,
            timeout: fields.optional()?,
            dynamic: fields.optional()?,
            dynamic_node_properties: fields.optional()?,
            capabilities: fields.optional()?,
        })
    }
}

macro_rules! composite_value {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Value {
                fn from(value: $ty) -> Self {
                    value.to_value()
                }
            }

            impl FromValue for $ty {
                fn from_value(value: Value) -> Result<Self> {
                    <$ty>::from_described(value)
                }
            }
        )*
    };
}

composite_value!(Source, Target, Header, Properties);

/// State of a delivery as carried by `transfer` and `disposition`.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryState {
    /// Partial progress of an unsettled delivery.
    Received {
        /// Section reached.
        section_number: u32,
        /// Offset within that section.
        section_offset: u64,
    },
    /// Processed successfully.
    Accepted,
    /// Invalid and not processable.
    Rejected {
        /// Reason for the rejection.
        error: Option<Error>,
    },
    /// Not and will not be processed.
    Released,
    /// Not processed and annotated.
    Modified {
        /// Count the delivery as a failed attempt.
        delivery_failed: Option<bool>,
        /// Do not redeliver to this link.
        undeliverable_here: Option<bool>,
        /// Annotations merged into the message.
        message_annotations: Option<Map>,
    },
}

impl DeliveryState {
    /// Whether this state is a terminal outcome.
    pub fn is_outcome(&self) -> bool {
        !matches!(self, DeliveryState::Received { .. })
    }

    /// A rejection carrying `error`.
    pub fn rejected(error: Error) -> Self {
        DeliveryState::Rejected { error: Some(error) }
    }
}

impl From<DeliveryState> for Value {
    fn from(state: DeliveryState) -> Self {
        let (code, mut fields) = match state {
            DeliveryState::Received {
                section_number,
                section_offset,
            } => (
                codes::RECEIVED,
                vec![section_number.into(), section_offset.into()],
            ),
            DeliveryState::Accepted => (codes::ACCEPTED, vec![]),
            DeliveryState::Rejected { error } => (codes::REJECTED, vec![error.into()]),
            DeliveryState::Released => (codes::RELEASED, vec![]),
            DeliveryState::Modified {
                delivery_failed,
                undeliverable_here,
                message_annotations,
            } => (
                codes::MODIFIED,
                vec![
                    delivery_failed.into(),
                    undeliverable_here.into(),
                    message_annotations.into(),
                ],
            ),
        };
        while matches!(fields.last(), Some(Value::Null)) {
            fields.pop();
        }
        Value::described(code, Value::List(fields))
    }
}

impl FromValue for DeliveryState {
    fn from_value(value: Value) -> Result<Self> {
        let (descriptor, inner) = match value {
            Value::Described(descriptor, inner) => (descriptor, inner),
            other => {
                return Err(CodecError::TypeMismatch {
                    expected: "delivery-state",
                    found: other.type_name(),
                })
            }
        };
        let items = match *inner {
            Value::List(items) => items,
            other => {
                return Err(CodecError::TypeMismatch {
                    expected: "list",
                    found: other.type_name(),
                })
            }
        };
        let mut fields = FieldReader::new(items);
        Ok(match descriptor_code(&descriptor) {
            Some(codes::RECEIVED) => DeliveryState::Received {
                section_number: fields.required("section-number")?,
                section_offset: fields.required("section-offset")?,
            },
            Some(codes::ACCEPTED) => DeliveryState::Accepted,
            Some(codes::REJECTED) => DeliveryState::Rejected {
                error: fields.optional()?,
            },
            Some(codes::RELEASED) => DeliveryState::Released,
            Some(codes::MODIFIED) => DeliveryState::Modified {
                delivery_failed: fields.optional()?,
                undeliverable_here: fields.optional()?,
                message_annotations: fields.optional()?,
            },
            _ => return Err(CodecError::UnknownDescriptor(format!("{:?}", descriptor))),
        })
    }
}

/// Transport headers of a message.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Header {
    /// Durability requirement.
    pub durable: Option<bool>,
    /// Relative priority.
    pub priority: Option<u8>,
    /// Time to live in milliseconds.
    pub ttl: Option<u32>,
    /// Whether no prior acquirer exists.
    pub first_acquirer: Option<bool>,
    /// Number of prior failed delivery attempts.
    pub delivery_count: Option<u32>,
}

impl Composite for Header {
    const CODE: u64 = codes::HEADER;
    const NAME: &'static str = "amqp:header:list";

    fn fields(&self) -> Vec<Value> {
        vec![
            self.durable.into(),
            self.priority.into(),
            self.ttl.into(),
            self.first_acquirer.into(),
            self.delivery_count.into(),
        ]
    }

    fn from_fields(fields: &mut FieldReader) -> Result<Self> {
        Ok(Self {
            durable: fields.optional()?,
            priority: fields.optional()?,
            ttl: fields.optional()?,
            first_acquirer: fields.optional()?,
            delivery_count: fields.optional()?,
        })
    }
}

/// Immutable properties of a message.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Properties {
    /// Application message identifier (ulong, uuid, binary or string).
    pub message_id: Option<Value>,
    /// Creating user.
    pub user_id: Option<Bytes>,
    /// Destination node.
    pub to: Option<String>,
    /// Application subject.
    pub subject: Option<String>,
    /// Node to send replies to.
    pub reply_to: Option<String>,
    /// Identifier of the message this one relates to.
    pub correlation_id: Option<Value>,
    /// MIME type of the body.
    pub content_type: Option<Symbol>,
    /// MIME content encoding.
    pub content_encoding: Option<Symbol>,
    /// Absolute expiry, milliseconds since the epoch.
    pub absolute_expiry_time: Option<i64>,
    /// Creation time, milliseconds since the epoch.
    pub creation_time: Option<i64>,
    /// Group the message belongs to.
    pub group_id: Option<String>,
    /// Position within the group.
    pub group_sequence: Option<u32>,
    /// Group replies are sent to.
    pub reply_to_group_id: Option<String>,
}

fn timestamp(fields: &mut FieldReader) -> Result<Option<i64>> {
    match fields.optional::<Value>()? {
        None => Ok(None),
        Some(Value::Timestamp(ms)) => Ok(Some(ms)),
        Some(other) => Err(CodecError::TypeMismatch {
            expected: "timestamp",
            found: other.type_name(),
        }),
    }
}

impl Composite for Properties {
    const CODE: u64 = codes::PROPERTIES;
    const NAME: &'static str = "amqp:properties:list";

    fn fields(&self) -> Vec<Value> {
        vec![
            self.message_id.clone().unwrap_or(Value::Null),
            self.user_id.clone().into(),
            self.to.clone().into(),
            self.subject.clone().into(),
            self.reply_to.clone().into(),
            self.correlation_id.clone().unwrap_or(Value::Null),
            self.content_type.clone().into(),
            self.content_encoding.clone().into(),
            self.absolute_expiry_time.map_or(Value::Null, Value::Timestamp),
            self.creation_time.map_or(Value::Null, Value::Timestamp),
            self.group_id.clone().into(),
            self.group_sequence.into(),
            self.reply_to_group_id.clone().into(),
        ]
    }

    fn from_fields(fields: &mut FieldReader) -> Result<Self> {
        Ok(Self {
            message_id: fields.optional()?,
            user_id: fields.optional()?,
            to: fields.optional()?,
            subject: fields.optional()?,
            reply_to: fields.optional()?,
            correlation_id: fields.optional()?,
            content_type: fields.optional()?,
            content_encoding: fields.optional()?,
            absolute_expiry_time: timestamp(fields)?,
            creation_time: timestamp(fields)?,
            group_id: fields.optional()?,
            group_sequence: fields.optional()?,
            reply_to_group_id: fields.optional()?,
        })
    }
}

/// Application payload of a message.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Body {
    /// No body section.
    #[default]
    Empty,
    /// One or more opaque data sections.
    Data(Vec<Bytes>),
    /// One or more sequence sections.
    Sequence(Vec<Vec<Value>>),
    /// A single AMQP value.
    Value(Value),
}

/// An AMQP message in its bare and annotated form.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Message {
    /// Transport headers.
    pub header: Option<Header>,
    /// Annotations for the next hop.
    pub delivery_annotations: Option<Map>,
    /// Annotations for all hops.
    pub message_annotations: Option<Map>,
    /// Immutable properties.
    pub properties: Option<Properties>,
    /// Structured application data.
    pub application_properties: Option<Map>,
    /// Payload.
    pub body: Body,
    /// Trailing annotations.
    pub footer: Option<Map>,
}

impl Message {
    /// A message whose body is a single AMQP value.
    pub fn with_value(value: impl Into<Value>) -> Self {
        Self {
            body: Body::Value(value.into()),
            ..Default::default()
        }
    }

    /// A message whose body is one data section.
    pub fn with_data(data: impl Into<Bytes>) -> Self {
        Self {
            body: Body::Data(vec![data.into()]),
            ..Default::default()
        }
    }

    /// Mutable access to the properties section, creating it when absent.
    pub fn properties_mut(&mut self) -> &mut Properties {
        self.properties.get_or_insert_with(Properties::default)
    }

    /// The `amqp-value` body, if that is the body kind.
    pub fn body_value(&self) -> Option<&Value> {
        match &self.body {
            Body::Value(value) => Some(value),
            _ => None,
        }
    }

    /// The message id from the properties section.
    pub fn message_id(&self) -> Option<&Value> {
        self.properties.as_ref()?.message_id.as_ref()
    }

    /// The reply-to address from the properties section.
    pub fn reply_to(&self) -> Option<&str> {
        self.properties.as_ref()?.reply_to.as_deref()
    }

    /// Encodes all present sections in order.
    pub fn encode(&self, buf: &mut BytesMut) {
        if let Some(header) = &self.header {
            header.encode(buf);
        }
        if let Some(map) = &self.delivery_annotations {
            Value::described(codes::DELIVERY_ANNOTATIONS, Value::Map(map.clone())).encode(buf);
        }
        if let Some(map) = &self.message_annotations {
            Value::described(codes::MESSAGE_ANNOTATIONS, Value::Map(map.clone())).encode(buf);
        }
        if let Some(properties) = &self.properties {
            properties.encode(buf);
        }
        if let Some(map) = &self.application_properties {
            Value::described(codes::APPLICATION_PROPERTIES, Value::Map(map.clone())).encode(buf);
        }
        match &self.body {
            Body::Empty => {}
            Body::Data(sections) => {
                for data in sections {
                    Value::described(codes::DATA, Value::Binary(data.clone())).encode(buf);
                }
            }
            Body::Sequence(sections) => {
                for items in sections {
                    Value::described(codes::AMQP_SEQUENCE, Value::List(items.clone())).encode(buf);
                }
            }
            Body::Value(value) => Value::described(codes::AMQP_VALUE, value.clone()).encode(buf),
        }
        if let Some(map) = &self.footer {
            Value::described(codes::FOOTER, Value::Map(map.clone())).encode(buf);
        }
    }

    /// Encodes the message into a fresh buffer.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decodes a message from the concatenated payload of a delivery.
    pub fn decode(mut buf: Bytes) -> Result<Message> {
        let mut message = Message::default();
        while !buf.is_empty() {
            let (descriptor, inner) = match Value::decode(&mut buf)? {
                Value::Described(descriptor, inner) => (descriptor, *inner),
                other => {
                    return Err(CodecError::TypeMismatch {
                        expected: "message section",
                        found: other.type_name(),
                    })
                }
            };
            let code = descriptor_code(&descriptor)
                .ok_or_else(|| CodecError::UnknownDescriptor(format!("{:?}", descriptor)))?;
            let section = Value::Described(descriptor, Box::new(inner.clone()));
            match code {
                codes::HEADER => message.header = Some(Header::from_described(section)?),
                codes::DELIVERY_ANNOTATIONS => message.delivery_annotations = Some(Map::from_value(inner)?),
                codes::MESSAGE_ANNOTATIONS => message.message_annotations = Some(Map::from_value(inner)?),
                codes::PROPERTIES => message.properties = Some(Properties::from_described(section)?),
                codes::APPLICATION_PROPERTIES => {
                    message.application_properties = Some(Map::from_value(inner)?)
                }
                codes::DATA => {
                    let data = Bytes::from_value(inner)?;
                    match &mut message.body {
                        Body::Data(sections) => sections.push(data),
                        body => *body = Body::Data(vec![data]),
                    }
                }
                codes::AMQP_SEQUENCE => {
                    let items = match inner {
                        Value::List(items) => items,
                        other => {
                            return Err(CodecError::TypeMismatch {
                                expected: "list",
                                found: other.type_name(),
                            })
                        }
                    };
                    match &mut message.body {
                        Body::Sequence(sections) => sections.push(items),
                        body => *body = Body::Sequence(vec![items]),
                    }
                }
                codes::AMQP_VALUE => message.body = Body::Value(inner),
                codes::FOOTER => message.footer = Some(Map::from_value(inner)?),
                other => return Err(CodecError::UnknownDescriptor(format!("0x{:x}", other))),
            }
        }
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definitions::condition;

    #[test]
    fn test_message_roundtrip_with_properties() {
        let mut message = Message::with_value("hello");
        message.header = Some(Header {
            durable: Some(true),
            ..Default::default()
        });
        let properties = message.properties_mut();
        properties.message_id = Some(Value::Ulong(42));
        properties.reply_to = Some("client-reply-1".to_string());
        properties.creation_time = Some(1_700_000_000_000);
        message.application_properties = Some(vec![(Value::from("k"), Value::Int(1))]);

        let decoded = Message::decode(message.to_bytes()).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(decoded.reply_to(), Some("client-reply-1"));
        assert_eq!(decoded.message_id(), Some(&Value::Ulong(42)));
    }

    #[test]
    fn test_multiple_data_sections() {
        let message = Message {
            body: Body::Data(vec![Bytes::from_static(b"a"), Bytes::from_static(b"bc")]),
            ..Default::default()
        };
        assert_eq!(Message::decode(message.to_bytes()).unwrap(), message);
    }

    #[test]
    fn test_delivery_state_rejected() {
        let state = DeliveryState::rejected(Error::new(condition::NOT_FOUND, "nope"));
        let mut bytes = Value::from(state.clone()).to_bytes();
        let decoded = DeliveryState::from_value(Value::decode(&mut bytes).unwrap()).unwrap();
        assert_eq!(decoded, state);
        assert!(decoded.is_outcome());
    }

    #[test]
    fn test_accepted_encoding_is_compact() {
        let bytes = Value::from(DeliveryState::Accepted).to_bytes();
        assert_eq!(bytes.as_ref(), &[0x00, 0x53, 0x24, 0x45]);
    }

    #[test]
    fn test_non_section_value_is_rejected() {
        assert!(Message::decode(Value::Uint(1).to_bytes()).is_err());
    }
}
