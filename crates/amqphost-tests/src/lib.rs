//! amqphost Test & Validation
//!
//! A frame-level AMQP 1.0 client and a host harness, plus end-to-end
//! scenarios running real connections against a [`amqphost_listener::ContainerHost`]
//! over TCP, TLS and WebSocket.

pub mod client;
pub mod harness;

#[cfg(test)]
mod host_integration;
#[cfg(test)]
mod security_integration;
#[cfg(test)]
mod transport_integration;

pub use client::TestClient;
pub use harness::{
    init_tracing, test_settings, Completion, EchoService, PanickingNode, RecordingNode, TestHost,
};
