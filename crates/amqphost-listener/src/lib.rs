#![warn(missing_docs)]

//! amqphost listener subsystem: AMQP 1.0 connections, sessions and links on the accepting side, SASL, connection listeners and the container host

pub mod address;
pub mod config;
pub mod connection;
pub mod container;
pub mod error;
pub mod host;
pub mod listener;
pub mod metrics;
pub mod processor;
pub mod sasl;

pub use address::{Address, Scheme};
pub use config::{
    ConnectionSettings, HostConfig, ListenerSettings, PlainCredentials, SaslSettings, TcpSettings,
    TlsSettings,
};
pub use connection::{
    CreditReceiver, Delivery, ListenerConnection, ListenerLink, ListenerSession, MessageHandler,
    OutcomeHandler,
};
pub use container::Container;
pub use error::{AmqpError, Result};
pub use host::{ContainerHost, REQUEST_LINK_CREDIT};
pub use listener::ConnectionListener;
pub use metrics::{HostMetrics, MetricsSnapshot};
pub use processor::{MessageContext, MessageProcessor, RequestContext, RequestProcessor};
pub use sasl::{ExternalMechanism, PlainMechanism, SaslMechanism};
