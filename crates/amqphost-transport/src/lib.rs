#![warn(missing_docs)]

//! amqphost transport subsystem: TCP, TLS and WebSocket byte streams, adaptive receive buffering, frame pump and ordered writer

pub mod error;
pub mod iops;
pub mod pump;
pub mod tcp;
pub mod tls;
pub mod transport;
pub mod websocket;
pub mod writer;

pub use error::{Result, TransportError};
pub use iops::{IopsConfig, IopsTracker};
pub use pump::{pump, FrameHandler, FrameReader, HEADER_SIZE};
pub use tcp::{TcpTransport, TcpTransportConfig};
pub use tls::{
    generate_self_signed_ca, generate_signed_cert, load_certs_from_pem, load_private_key_from_pem,
    CertificateValidator, TlsAcceptor, TlsConfig, TlsConnector, TlsStream, TlsTransport,
};
pub use transport::Transport;
pub use websocket::{WebSocketTransport, AMQP_SUBPROTOCOL};
pub use writer::Writer;
