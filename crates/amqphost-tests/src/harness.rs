//! Test harness: a host bound to an ephemeral port plus recording processors.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use amqphost_listener::{
    ContainerHost, Delivery, ListenerSettings, MessageContext, MessageProcessor, RequestContext,
    RequestProcessor,
};
use amqphost_types::Message;
use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing_subscriber::EnvFilter;

/// Sends host logs to the test output once per process. `RUST_LOG` picks the
/// level; warnings and errors are shown by default.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .with_ansi(false)
        .try_init();
}

/// Default settings with a short close timeout, so stopping a host with
/// unresponsive clients stays quick.
pub fn test_settings() -> ListenerSettings {
    let mut settings = ListenerSettings::default();
    settings.connection.close_timeout_ms = 500;
    settings
}

/// A running [`ContainerHost`] with one listener.
#[derive(Debug)]
pub struct TestHost {
    host: ContainerHost,
    addr: SocketAddr,
}

impl TestHost {
    /// Opens a host on `amqp://127.0.0.1:0` with [`test_settings`].
    pub async fn start() -> Result<Self> {
        Self::start_on("amqp://127.0.0.1:0", test_settings()).await
    }

    /// Opens a host on `address`, which should name port 0.
    pub async fn start_on(address: &str, settings: ListenerSettings) -> Result<Self> {
        init_tracing();
        let mut host = ContainerHost::new([address], settings)?;
        host.open().await?;
        let addr = host
            .listeners()
            .first()
            .and_then(|l| l.local_addrs().first().copied())
            .ok_or_else(|| anyhow!("{} did not bind", address))?;
        Ok(Self { host, addr })
    }

    /// The bound socket address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The host, for registering processors.
    pub fn host(&self) -> &ContainerHost {
        &self.host
    }

    /// Closes all listeners.
    pub async fn stop(mut self) {
        self.host.close().await;
    }
}

/// What a [`RecordingNode`] does with each message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Accept at once.
    Accept,
    /// Keep the delivery unsettled for the test to dispose.
    Hold,
}

/// Message processor that records what it receives.
#[derive(Debug)]
pub struct RecordingNode {
    credit: u32,
    completion: Completion,
    messages: Mutex<Vec<Message>>,
    held: Mutex<Vec<Delivery>>,
    arrived: Notify,
}

impl RecordingNode {
    /// A node granting `credit` that settles according to `completion`.
    pub fn new(credit: u32, completion: Completion) -> Arc<Self> {
        Arc::new(Self {
            credit,
            completion,
            messages: Mutex::new(Vec::new()),
            held: Mutex::new(Vec::new()),
            arrived: Notify::new(),
        })
    }

    /// Messages received so far.
    pub fn messages(&self) -> Vec<Message> {
        self.messages.lock().clone()
    }

    /// Deliveries kept unsettled by [`Completion::Hold`].
    pub fn held(&self) -> Vec<Delivery> {
        self.held.lock().clone()
    }

    /// Waits until at least `count` messages have arrived.
    pub async fn wait_for(&self, count: usize) -> Result<Vec<Message>> {
        let wait = async {
            loop {
                let notified = self.arrived.notified();
                if self.messages.lock().len() >= count {
                    return self.messages();
                }
                notified.await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .map_err(|_| anyhow!("fewer than {} messages arrived", count))
    }
}

impl MessageProcessor for RecordingNode {
    fn credit(&self) -> u32 {
        self.credit
    }

    fn process(&self, context: MessageContext) {
        self.messages.lock().push(context.message().clone());
        match self.completion {
            Completion::Accept => context.complete(),
            Completion::Hold => self.held.lock().push(context.delivery().clone()),
        }
        self.arrived.notify_waiters();
    }
}

/// Message processor that panics on every message.
#[derive(Debug, Default)]
pub struct PanickingNode;

impl MessageProcessor for PanickingNode {
    fn credit(&self) -> u32 {
        5
    }

    fn process(&self, context: MessageContext) {
        panic!("processor failed on {:?}", context.message().body_value());
    }
}

/// Request processor answering every request with its own body.
#[derive(Debug, Default)]
pub struct EchoService {
    failures: Mutex<Vec<String>>,
}

impl EchoService {
    /// Errors from responses that could not be sent.
    pub fn failures(&self) -> Vec<String> {
        self.failures.lock().clone()
    }
}

impl RequestProcessor for EchoService {
    fn process(&self, context: RequestContext) {
        let mut response = Message::default();
        response.body = context.message().body.clone();
        if let Err(e) = context.complete(response) {
            self.failures.lock().push(e.to_string());
        }
    }
}
