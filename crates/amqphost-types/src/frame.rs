//! Frame layout: `[size:4][doff:1][type:1][channel:2][extended header][body][payload]`.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::convert::Composite;
use crate::error::{CodecError, Result};
use crate::performatives::{Performative, Transfer};
use crate::sasl::SaslFrame;
use crate::value::Value;

/// Size of the fixed frame header and of the protocol header.
pub const FRAME_HEADER_SIZE: usize = 8;

/// Smallest max-frame-size a peer may advertise.
pub const MIN_MAX_FRAME_SIZE: u32 = 512;

/// An empty AMQP frame on channel 0, used as a heartbeat.
pub const HEARTBEAT: [u8; 8] = [0, 0, 0, 8, 2, 0, 0, 0];

const FRAME_TYPE_AMQP: u8 = 0;
const FRAME_TYPE_SASL: u8 = 1;

/// Protocol layer announced by a protocol header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolId {
    /// Plain AMQP framing.
    Amqp,
    /// In-band TLS negotiation.
    Tls,
    /// SASL negotiation.
    Sasl,
}

/// The 8-byte header that starts every protocol layer: `AMQP id major minor revision`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolHeader {
    /// Protocol layer.
    pub id: ProtocolId,
    /// Major version.
    pub major: u8,
    /// Minor version.
    pub minor: u8,
    /// Revision.
    pub revision: u8,
}

impl ProtocolHeader {
    /// AMQP 1.0.0 header.
    pub const fn amqp() -> Self {
        Self {
            id: ProtocolId::Amqp,
            major: 1,
            minor: 0,
            revision: 0,
        }
    }

    /// SASL 1.0.0 header.
    pub const fn sasl() -> Self {
        Self {
            id: ProtocolId::Sasl,
            major: 1,
            minor: 0,
            revision: 0,
        }
    }

    /// Whether the announced version is 1.0.0.
    pub fn is_supported_version(&self) -> bool {
        self.major == 1 && self.minor == 0 && self.revision == 0
    }

    /// Wire form of the header.
    pub fn to_bytes(&self) -> [u8; 8] {
        let id = match self.id {
            ProtocolId::Amqp => 0,
            ProtocolId::Tls => 2,
            ProtocolId::Sasl => 3,
        };
        [b'A', b'M', b'Q', b'P', id, self.major, self.minor, self.revision]
    }

    /// Parses a received header.
    pub fn parse(raw: &[u8; 8]) -> Result<Self> {
        if &raw[..4] != b"AMQP" {
            return Err(CodecError::InvalidProtocolHeader(*raw));
        }
        let id = match raw[4] {
            0 => ProtocolId::Amqp,
            2 => ProtocolId::Tls,
            3 => ProtocolId::Sasl,
            _ => return Err(CodecError::InvalidProtocolHeader(*raw)),
        };
        Ok(Self {
            id,
            major: raw[5],
            minor: raw[6],
            revision: raw[7],
        })
    }
}

/// Decoded frame body.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameBody {
    /// AMQP performative.
    Amqp(Performative),
    /// SASL frame.
    Sasl(SaslFrame),
    /// Empty frame (heartbeat).
    Empty,
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Channel number; always 0 for SASL frames.
    pub channel: u16,
    /// Frame body.
    pub body: FrameBody,
    /// Bytes following the performative (transfer payload).
    pub payload: Bytes,
}

fn write_frame(frame_type: u8, channel: u16, body: &Value, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(64 + payload.len());
    buf.put_u32(0);
    buf.put_u8(2);
    buf.put_u8(frame_type);
    buf.put_u16(channel);
    body.encode(&mut buf);
    buf.put_slice(payload);
    let size = buf.len() as u32;
    buf[..4].copy_from_slice(&size.to_be_bytes());
    buf.freeze()
}

/// Encodes an AMQP frame.
pub fn encode_frame(channel: u16, performative: &Performative, payload: &[u8]) -> Bytes {
    write_frame(FRAME_TYPE_AMQP, channel, &performative.to_value(), payload)
}

/// Encodes a SASL frame.
pub fn encode_sasl_frame(body: &SaslFrame) -> Bytes {
    write_frame(FRAME_TYPE_SASL, 0, &body.to_value(), &[])
}

/// Encodes a delivery as one or more transfer frames no larger than `max_frame_size`.
///
/// Continuation frames carry only the handle, the delivery id and `more`.
pub fn encode_transfer(
    channel: u16,
    transfer: &Transfer,
    mut payload: Bytes,
    max_frame_size: u32,
) -> Vec<Bytes> {
    let mut frames = Vec::new();
    let mut first = true;
    loop {
        let mut current = if first {
            transfer.clone()
        } else {
            Transfer {
                handle: transfer.handle,
                delivery_id: transfer.delivery_id,
                ..Default::default()
            }
        };
        current.more = true;
        let overhead = FRAME_HEADER_SIZE + current.to_value().to_bytes().len();
        let room = (max_frame_size as usize).saturating_sub(overhead).max(1);
        if payload.len() <= room {
            current.more = transfer.more;
            frames.push(encode_frame(channel, &Performative::Transfer(current), &payload));
            return frames;
        }
        let chunk = payload.split_to(room);
        frames.push(encode_frame(channel, &Performative::Transfer(current), &chunk));
        first = false;
    }
}

/// Decodes a complete frame, including its 4-byte size prefix.
pub fn decode_frame(mut buf: Bytes) -> Result<Frame> {
    if buf.len() < FRAME_HEADER_SIZE {
        return Err(CodecError::InvalidFrame {
            reason: format!("frame of {} bytes is shorter than its header", buf.len()),
        });
    }
    let size = buf.get_u32() as usize;
    if size != buf.len() + 4 {
        return Err(CodecError::InvalidFrame {
            reason: format!("size field {} does not match {} bytes", size, buf.len() + 4),
        });
    }
    let doff = buf.get_u8() as usize * 4;
    let frame_type = buf.get_u8();
    let channel = buf.get_u16();
    if doff < FRAME_HEADER_SIZE || doff > size {
        return Err(CodecError::InvalidFrame {
            reason: format!("invalid data offset {}", doff),
        });
    }
    buf.advance(doff - FRAME_HEADER_SIZE);
    if buf.is_empty() {
        return Ok(Frame {
            channel,
            body: FrameBody::Empty,
            payload: Bytes::new(),
        });
    }
    let value = Value::decode(&mut buf)?;
    let body = match frame_type {
        FRAME_TYPE_AMQP => FrameBody::Amqp(Performative::from_value(value)?),
        FRAME_TYPE_SASL => FrameBody::Sasl(SaslFrame::from_value(value)?),
        other => {
            return Err(CodecError::InvalidFrame {
                reason: format!("unknown frame type {}", other),
            })
        }
    };
    Ok(Frame {
        channel,
        body,
        payload: buf,
    })
}
