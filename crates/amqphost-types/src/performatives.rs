//! Transport performatives: the bodies of AMQP frames.

use bytes::Bytes;

use crate::codes;
use crate::convert::{descriptor_code, Composite, FieldReader};
use crate::definitions::{Error, ReceiverSettleMode, Role, SenderSettleMode};
use crate::error::{CodecError, Result};
use crate::messaging::{DeliveryState, Source, Target};
use crate::value::{Map, Symbol, Value};

/// Negotiates connection parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Open {
    /// Identifier of the sending container.
    pub container_id: String,
    /// Virtual host name requested by the peer.
    pub hostname: Option<String>,
    /// Largest frame the sender accepts.
    pub max_frame_size: u32,
    /// Highest channel number the sender accepts.
    pub channel_max: u16,
    /// Idle timeout of the sender in milliseconds.
    pub idle_time_out: Option<u32>,
    /// Locales for outgoing text.
    pub outgoing_locales: Option<Vec<Symbol>>,
    /// Desired locales for incoming text.
    pub incoming_locales: Option<Vec<Symbol>>,
    /// Extensions supported by the sender.
    pub offered_capabilities: Option<Vec<Symbol>>,
    /// Extensions the sender can use.
    pub desired_capabilities: Option<Vec<Symbol>>,
    /// Connection properties.
    pub properties: Option<Map>,
}

impl Open {
    /// An open with protocol defaults for everything but the container id.
    pub fn new(container_id: impl Into<String>) -> Self {
        Self {
            container_id: container_id.into(),
            hostname: None,
            max_frame_size: u32::MAX,
            channel_max: u16::MAX,
            idle_time_out: None,
            outgoing_locales: None,
            incoming_locales: None,
            offered_capabilities: None,
            desired_capabilities: None,
            properties: None,
        }
    }
}

impl Composite for Open {
    const CODE: u64 = codes::OPEN;
    const NAME: &'static str = "amqp:open:list";

    fn fields(&self) -> Vec<Value> {
        vec![
            self.container_id.clone().into(),
            self.hostname.clone().into(),
            self.max_frame_size.into(),
            self.channel_max.into(),
            self.idle_time_out.into(),
            self.outgoing_locales.clone().into(),
            self.incoming_locales.clone().into(),
            self.offered_capabilities.clone().into(),
            self.desired_capabilities.clone().into(),
            self.properties.clone().into(),
        ]
    }

    fn from_fields(fields: &mut FieldReader) -> Result<Self> {
        Ok(Self {
            container_id: fields.required("container-id")?,
            hostname: fields.optional()?,
            max_frame_size: fields.or(u32::MAX)?,
            channel_max: fields.or(u16::MAX)?,
            idle_time_out: fields.optional()?,
            outgoing_locales: fields.optional()?,
            incoming_locales: fields.optional()?,
            offered_capabilities: fields.optional()?,
            desired_capabilities: fields.optional()?,
            properties: fields.optional()?,
        })
    }
}

/// Begins a session on a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Begin {
    /// Channel of the peer's session when answering a begin.
    pub remote_channel: Option<u16>,
    /// First transfer id the sender will use.
    pub next_outgoing_id: u32,
    /// Initial incoming window of the sender.
    pub incoming_window: u32,
    /// Initial outgoing window of the sender.
    pub outgoing_window: u32,
    /// Highest link handle the sender accepts.
    pub handle_max: u32,
    /// Extensions supported by the sender.
    pub offered_capabilities: Option<Vec<Symbol>>,
    /// Extensions the sender can use.
    pub desired_capabilities: Option<Vec<Symbol>>,
    /// Session properties.
    pub properties: Option<Map>,
}

impl Composite for Begin {
    const CODE: u64 = codes::BEGIN;
    const NAME: &'static str = "amqp:begin:list";

    fn fields(&self) -> Vec<Value> {
        vec![
            self.remote_channel.into(),
            self.next_outgoing_id.into(),
            self.incoming_window.into(),
            self.outgoing_window.into(),
            self.handle_max.into(),
            self.offered_capabilities.clone().into(),
            self.desired_capabilities.clone().into(),
            self.properties.clone().into(),
        ]
    }

    fn from_fields(fields: &mut FieldReader) -> Result<Self> {
        Ok(Self {
            remote_channel: fields.optional()?,
            next_outgoing_id: fields.required("next-outgoing-id")?,
            incoming_window: fields.required("incoming-window")?,
            outgoing_window: fields.required("outgoing-window")?,
            handle_max: fields.or(u32::MAX)?,
            offered_capabilities: fields.optional()?,
            desired_capabilities: fields.optional()?,
            properties: fields.optional()?,
        })
    }
}

/// Attaches a link to a session.
#[derive(Debug, Clone, PartialEq)]
pub struct Attach {
    /// Link name, unique per direction within the container pair.
    pub name: String,
    /// Handle chosen by the sender of this frame.
    pub handle: u32,
    /// Role of the sender of this frame.
    pub role: Role,
    /// Settlement policy of the sending endpoint.
    pub snd_settle_mode: SenderSettleMode,
    /// Settlement policy of the receiving endpoint.
    pub rcv_settle_mode: ReceiverSettleMode,
    /// Source terminus.
    pub source: Option<Source>,
    /// Target terminus.
    pub target: Option<Target>,
    /// Unsettled delivery state.
    pub unsettled: Option<Map>,
    /// Whether `unsettled` is incomplete.
    pub incomplete_unsettled: bool,
    /// Delivery count of a sending endpoint.
    pub initial_delivery_count: Option<u32>,
    /// Largest acceptable message.
    pub max_message_size: Option<u64>,
    /// Extensions supported by the sender.
    pub offered_capabilities: Option<Vec<Symbol>>,
    /// Extensions the sender can use.
    pub desired_capabilities: Option<Vec<Symbol>>,
    /// Link properties.
    pub properties: Option<Map>,
}

impl Attach {
    /// An attach with protocol defaults.
    pub fn new(name: impl Into<String>, handle: u32, role: Role) -> Self {
        Self {
            name: name.into(),
            handle,
            role,
            snd_settle_mode: SenderSettleMode::default(),
            rcv_settle_mode: ReceiverSettleMode::default(),
            source: None,
            target: None,
            unsettled: None,
            incomplete_unsettled: false,
            initial_delivery_count: None,
            max_message_size: None,
            offered_capabilities: None,
            desired_capabilities: None,
            properties: None,
        }
    }

    /// Address of the source terminus.
    pub fn source_address(&self) -> Option<&str> {
        self.source.as_ref()?.address.as_deref()
    }

    /// Address of the target terminus.
    pub fn target_address(&self) -> Option<&str> {
        self.target.as_ref()?.address.as_deref()
    }
}

impl Composite for Attach {
    const CODE: u64 = codes::ATTACH;
    const NAME: &'static str = "amqp:attach:list";

    fn fields(&self) -> Vec<Value> {
        vec![
            self.name.clone().into(),
            self.handle.into(),
            self.role.into(),
            self.snd_settle_mode.into(),
            self.rcv_settle_mode.into(),
            self.source.clone().into(),
            self.target.clone().into(),
            self.unsettled.clone().into(),
            self.incomplete_unsettled.into(),
            self.initial_delivery_count.into(),
            self.max_message_size.into(),
            self.offered_capabilities.clone().into(),
            self.desired_capabilities.clone().into(),
            self.properties.clone().into(),
        ]
    }

    fn from_fields(fields: &mut FieldReader) -> Result<Self> {
        Ok(Self {
            name: fields.required("name")?,
            handle: fields.required("handle")?,
            role: fields.required("role")?,
            snd_settle_mode: fields.or(SenderSettleMode::default())?,
            rcv_settle_mode: fields.or(ReceiverSettleMode::default())?,
            source: fields.optional()?,
            target: fields.optional()?,
            unsettled: fields.optional()?,
            incomplete_unsettled: fields.or(false)?,
            initial_delivery_count: fields.optional()?,
            max_message_size: fields.optional()?,
            offered_capabilities: fields.optional()?,
            desired_capabilities: fields.optional()?,
            properties: fields.optional()?,
        })
    }
}

/// Updates session and, with a handle, link flow state.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Flow {
    /// Next transfer id expected from the receiver of this frame.
    pub next_incoming_id: Option<u32>,
    /// Incoming window of the sender.
    pub incoming_window: u32,
    /// Next transfer id the sender will use.
    pub next_outgoing_id: u32,
    /// Outgoing window of the sender.
    pub outgoing_window: u32,
    /// Link the link-level fields refer to.
    pub handle: Option<u32>,
    /// Link delivery count.
    pub delivery_count: Option<u32>,
    /// Link credit.
    pub link_credit: Option<u32>,
    /// Messages available at the sender.
    pub available: Option<u32>,
    /// Drain mode.
    pub drain: bool,
    /// Request for a flow in reply.
    pub echo: bool,
    /// Link state properties.
    pub properties: Option<Map>,
}

impl Composite for Flow {
    const CODE: u64 = codes::FLOW;
    const NAME: &'static str = "amqp:flow:list";

    fn fields(&self) -> Vec<Value> {
        vec![
            self.next_incoming_id.into(),
            self.incoming_window.into(),
            self.next_outgoing_id.into(),
            self.outgoing_window.into(),
            self.handle.into(),
            self.delivery_count.into(),
            self.link_credit.into(),
            self.available.into(),
            self.drain.into(),
            self.echo.into(),
            self.properties.clone().into(),
        ]
    }

    fn from_fields(fields: &mut FieldReader) -> Result<Self> {
        Ok(Self {
            next_incoming_id: fields.optional()?,
            incoming_window: fields.required("incoming-window")?,
            next_outgoing_id: fields.required("next-outgoing-id")?,
            outgoing_window: fields.required("outgoing-window")?,
            handle: fields.optional()?,
            delivery_count: fields.optional()?,
            link_credit: fields.optional()?,
            available: fields.optional()?,
            drain: fields.or(false)?,
            echo: fields.or(false)?,
            properties: fields.optional()?,
        })
    }
}

/// Carries (part of) a message on a link.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Transfer {
    /// Link handle.
    pub handle: u32,
    /// Session-scoped delivery id; mandatory on the first frame of a delivery.
    pub delivery_id: Option<u32>,
    /// Link-scoped delivery tag; mandatory on the first frame of a delivery.
    pub delivery_tag: Option<Bytes>,
    /// Message format code.
    pub message_format: Option<u32>,
    /// Whether the delivery is settled by the sender.
    pub settled: Option<bool>,
    /// More frames follow for this delivery.
    pub more: bool,
    /// Receiver settlement mode for this delivery.
    pub rcv_settle_mode: Option<ReceiverSettleMode>,
    /// Delivery state at the sender.
    pub state: Option<DeliveryState>,
    /// Resumed delivery.
    pub resume: bool,
    /// Delivery was aborted by the sender.
    pub aborted: bool,
    /// Batchable hint.
    pub batchable: bool,
}

impl Composite for Transfer {
    const CODE: u64 = codes::TRANSFER;
    const NAME: &'static str = "amqp:transfer:list";

    fn fields(&self) -> Vec<Value> {
        vec![
            self.handle.into(),
            self.delivery_id.into(),
            self.delivery_tag.clone().into(),
            self.message_format.into(),
            self.settled.into(),
            self.more.into(),
            self.rcv_settle_mode.into(),
            self.state.clone().into(),
            self.resume.into(),
            self.aborted.into(),
            self.batchable.into(),
        ]
    }

    fn from_fields(fields: &mut FieldReader) -> Result<Self> {
        Ok(Self {
            handle: fields.required("handle")?,
            delivery_id: fields.optional()?,
            delivery_tag: fields.optional()?,
            message_format: fields.optional()?,
            settled: fields.optional()?,
            more: fields.or(false)?,
            rcv_settle_mode: fields.optional()?,
            state: fields.optional()?,
            resume: fields.or(false)?,
            aborted: fields.or(false)?,
            batchable: fields.or(false)?,
        })
    }
}

/// Informs the peer of delivery state changes over a range of deliveries.
#[derive(Debug, Clone, PartialEq)]
pub struct Disposition {
    /// Role of the sender of this frame.
    pub role: Role,
    /// First delivery id in the range.
    pub first: u32,
    /// Last delivery id in the range, `first` when absent.
    pub last: Option<u32>,
    /// Whether the deliveries are settled.
    pub settled: bool,
    /// New delivery state.
    pub state: Option<DeliveryState>,
    /// Batchable hint.
    pub batchable: bool,
}

impl Composite for Disposition {
    const CODE: u64 = codes::DISPOSITION;
    const NAME: &'static str = "amqp:disposition:list";

    fn fields(&self) -> Vec<Value> {
        vec![
            self.role.into(),
            self.first.into(),
            self.last.into(),
            self.settled.into(),
            self.state.clone().into(),
            self.batchable.into(),
        ]
    }

    fn from_fields(fields: &mut FieldReader) -> Result<Self> {
        Ok(Self {
            role: fields.required("role")?,
            first: fields.required("first")?,
            last: fields.optional()?,
            settled: fields.or(false)?,
            state: fields.optional()?,
            batchable: fields.or(false)?,
        })
    }
}

/// Detaches a link from its session.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Detach {
    /// Link handle.
    pub handle: u32,
    /// Whether the link is closed rather than suspended.
    pub closed: bool,
    /// Reason for the detach.
    pub error: Option<Error>,
}

impl Composite for Detach {
    const CODE: u64 = codes::DETACH;
    const NAME: &'static str = "amqp:detach:list";

    fn fields(&self) -> Vec<Value> {
        vec![self.handle.into(), self.closed.into(), self.error.clone().into()]
    }

    fn from_fields(fields: &mut FieldReader) -> Result<Self> {
        Ok(Self {
            handle: fields.required("handle")?,
            closed: fields.or(false)?,
            error: fields.optional()?,
        })
    }
}

/// Ends a session.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct End {
    /// Reason for ending the session.
    pub error: Option<Error>,
}

impl Composite for End {
    const CODE: u64 = codes::END;
    const NAME: &'static str = "amqp:end:list";

    fn fields(&self) -> Vec<Value> {
        vec![self.error.clone().into()]
    }

    fn from_fields(fields: &mut FieldReader) -> Result<Self> {
        Ok(Self {
            error: fields.optional()?,
        })
    }
}

/// Closes a connection.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Close {
    /// Reason for closing the connection.
    pub error: Option<Error>,
}

impl Composite for Close {
    const CODE: u64 = codes::CLOSE;
    const NAME: &'static str = "amqp:close:list";

    fn fields(&self) -> Vec<Value> {
        vec![self.error.clone().into()]
    }

    fn from_fields(fields: &mut FieldReader) -> Result<Self> {
        Ok(Self {
            error: fields.optional()?,
        })
    }
}

/// Any performative carried by an AMQP frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Performative {
    /// `open`
    Open(Open),
    /// `begin`
    Begin(Begin),
    /// `attach`
    Attach(Attach),
    /// `flow`
    Flow(Flow),
    /// `transfer`
    Transfer(Transfer),
    /// `disposition`
    Disposition(Disposition),
    /// `detach`
    Detach(Detach),
    /// `end`
    End(End),
    /// `close`
    Close(Close),
}

impl Performative {
    /// Performative name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Performative::Open(_) => "open",
            Performative::Begin(_) => "begin",
            Performative::Attach(_) => "attach",
            Performative::Flow(_) => "flow",
            Performative::Transfer(_) => "transfer",
            Performative::Disposition(_) => "disposition",
            Performative::Detach(_) => "detach",
            Performative::End(_) => "end",
            Performative::Close(_) => "close",
        }
    }

    /// The described value of the performative.
    pub fn to_value(&self) -> Value {
        match self {
            Performative::Open(p) => p.to_value(),
            Performative::Begin(p) => p.to_value(),
            Performative::Attach(p) => p.to_value(),
            Performative::Flow(p) => p.to_value(),
            Performative::Transfer(p) => p.to_value(),
            Performative::Disposition(p) => p.to_value(),
            Performative::Detach(p) => p.to_value(),
            Performative::End(p) => p.to_value(),
            Performative::Close(p) => p.to_value(),
        }
    }

    /// Converts a decoded frame body.
    pub fn from_value(value: Value) -> Result<Self> {
        let code = match &value {
            Value::Described(descriptor, _) => descriptor_code(descriptor),
            other => {
                return Err(CodecError::TypeMismatch {
                    expected: "performative",
                    found: other.type_name(),
                })
            }
        };
        Ok(match code {
            Some(codes::OPEN) => Performative::Open(Open::from_described(value)?),
            Some(codes::BEGIN) => Performative::Begin(Begin::from_described(value)?),
            Some(codes::ATTACH) => Performative::Attach(Attach::from_described(value)?),
            Some(codes::FLOW) => Performative::Flow(Flow::from_described(value)?),
            Some(codes::TRANSFER) => Performative::Transfer(Transfer::from_described(value)?),
            Some(codes::DISPOSITION) => {
                Performative::Disposition(Disposition::from_described(value)?)
            }
            Some(codes::DETACH) => Performative::Detach(Detach::from_described(value)?),
            Some(codes::END) => Performative::End(End::from_described(value)?),
            Some(codes::CLOSE) => Performative::Close(Close::from_described(value)?),
            _ => return Err(CodecError::UnknownDescriptor(format!("{:?}", value))),
        })
    }
}

macro_rules! into_performative {
    ($($ty:ident),*) => {
        $(
            impl From<$ty> for Performative {
                fn from(p: $ty) -> Self {
                    Performative::$ty(p)
                }
            }
        )*
    };
}

into_performative!(Open, Begin, Attach, Flow, Transfer, Disposition, Detach, End, Close);

#[cfg(test)]
mod tests {
    use super::*;

    fn reencode(p: Performative) -> Performative {
        let mut bytes = p.to_value().to_bytes();
        Performative::from_value(Value::decode(&mut bytes).unwrap()).unwrap()
    }

    #[test]
    fn test_attach_roundtrip() {
        let mut attach = Attach::new("link-1", 3, Role::Sender);
        attach.target = Some(Target::with_address("echo"));
        attach.snd_settle_mode = SenderSettleMode::Settled;
        attach.initial_delivery_count = Some(0);
        assert_eq!(
            reencode(attach.clone().into()),
            Performative::Attach(attach.clone())
        );
        assert_eq!(attach.target_address(), Some("echo"));
        assert_eq!(attach.source_address(), None);
    }

    #[test]
    fn test_open_defaults_when_fields_omitted() {
        let value = Value::described(codes::OPEN, Value::List(vec![Value::from("peer")]));
        match Performative::from_value(value).unwrap() {
            Performative::Open(open) => {
                assert_eq!(open.container_id, "peer");
                assert_eq!(open.max_frame_size, u32::MAX);
                assert_eq!(open.channel_max, u16::MAX);
                assert_eq!(open.idle_time_out, None);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_open_requires_container_id() {
        let value = Value::described(codes::OPEN, Value::List(vec![]));
        assert_eq!(
            Performative::from_value(value),
            Err(CodecError::MissingField("container-id"))
        );
    }

    #[test]
    fn test_transfer_with_state() {
        let transfer = Transfer {
            handle: 1,
            delivery_id: Some(9),
            delivery_tag: Some(Bytes::from_static(&[0, 0, 0, 1])),
            settled: Some(false),
            more: true,
            state: Some(DeliveryState::Accepted),
            ..Default::default()
        };
        assert_eq!(reencode(transfer.clone().into()), Performative::Transfer(transfer));
    }

    #[test]
    fn test_unknown_descriptor() {
        let value = Value::described(0x99, Value::List(vec![]));
        assert!(matches!(
            Performative::from_value(value),
            Err(CodecError::UnknownDescriptor(_))
        ));
    }
}
