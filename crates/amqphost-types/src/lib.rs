#![warn(missing_docs)]

//! amqphost type system: AMQP 1.0 values, performatives, messages, SASL bodies and frame codec

pub mod codes;
pub mod convert;
pub mod definitions;
pub mod error;
pub mod frame;
pub mod messaging;
pub mod performatives;
pub mod sasl;
pub mod value;

pub use convert::{Composite, FieldReader, FromValue};
pub use definitions::{condition, Error, ReceiverSettleMode, Role, SenderSettleMode};
pub use error::{CodecError, Result};
pub use frame::{
    decode_frame, encode_frame, encode_sasl_frame, encode_transfer, Frame, FrameBody,
    ProtocolHeader, ProtocolId, FRAME_HEADER_SIZE, HEARTBEAT, MIN_MAX_FRAME_SIZE,
};
pub use messaging::{Body, DeliveryState, Header, Message, Properties, Source, Target};
pub use performatives::{
    Attach, Begin, Close, Detach, Disposition, End, Flow, Open, Performative, Transfer,
};
pub use sasl::{SaslChallenge, SaslCode, SaslFrame, SaslInit, SaslMechanisms, SaslOutcome, SaslResponse};
pub use value::{Descriptor, Map, Symbol, Value};
