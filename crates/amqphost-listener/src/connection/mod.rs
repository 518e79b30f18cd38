//! Listener-side AMQP connections: handshake, frame dispatch, sessions and links.
//!
//! Each accepted transport is driven by one task. Frames from the read pump
//! and commands from application handles are serialized through that task,
//! which owns all connection, session and link protocol state.

mod actor;
pub mod link;
pub mod session;

use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use amqphost_transport::{pump, FrameHandler, FrameReader, Transport, TransportError, Writer};
use amqphost_types::{DeliveryState, Error, ProtocolHeader, ProtocolId, MIN_MAX_FRAME_SIZE};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ConnectionSettings;
use crate::container::Container;
use crate::error::{AmqpError, Result};
use crate::metrics::HostMetrics;
use crate::sasl::{self, SaslMechanism, SaslNegotiator};

pub use link::{CreditReceiver, Delivery, ListenerLink, MessageHandler, OutcomeHandler};
pub use session::ListenerSession;

use actor::ConnectionActor;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Frames buffered between the read pump and the connection task.
const FRAME_QUEUE_DEPTH: usize = 64;

/// Requests from application handles to the connection task.
#[derive(Debug)]
pub(crate) enum Command {
    SendMessage {
        channel: u16,
        handle: u32,
        link_id: u64,
        payload: Bytes,
        tag: Bytes,
        settled: bool,
    },
    Dispose {
        channel: u16,
        delivery_id: u32,
        state: Option<DeliveryState>,
        settled: bool,
    },
    Flow {
        channel: u16,
        handle: u32,
        link_id: u64,
        credit: u32,
    },
    CompleteAttach {
        channel: u16,
        handle: u32,
        link_id: u64,
        error: Option<Error>,
    },
    Detach {
        channel: u16,
        handle: u32,
        link_id: u64,
        error: Option<Error>,
    },
    EndSession {
        channel: u16,
        error: Option<Error>,
    },
    Close {
        error: Option<Error>,
    },
    IoError(TransportError),
}

struct ConnectionShared {
    id: u64,
    peer_addr: String,
    local_addr: String,
    commands: mpsc::UnboundedSender<Command>,
    remote_container_id: Mutex<Option<String>>,
    identity: Mutex<Option<String>>,
    credit_channel_capacity: usize,
    closed: AtomicBool,
    closed_notify: Notify,
}

/// Handle to an accepted connection.
#[derive(Clone)]
pub struct ListenerConnection {
    inner: Arc<ConnectionShared>,
}

impl std::fmt::Debug for ListenerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerConnection")
            .field("id", &self.inner.id)
            .field("peer_addr", &self.inner.peer_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ListenerConnection {
    fn new(
        peer_addr: String,
        local_addr: String,
        credit_channel_capacity: usize,
    ) -> (Self, mpsc::UnboundedReceiver<Command>) {
        let (commands, rx) = mpsc::unbounded_channel();
        let connection = Self {
            inner: Arc::new(ConnectionShared {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                peer_addr,
                local_addr,
                commands,
                remote_container_id: Mutex::new(None),
                identity: Mutex::new(None),
                credit_channel_capacity,
                closed: AtomicBool::new(false),
                closed_notify: Notify::new(),
            }),
        };
        (connection, rx)
    }

    /// Process-wide unique id.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Remote endpoint of the transport.
    pub fn peer_addr(&self) -> &str {
        &self.inner.peer_addr
    }

    /// Local endpoint of the transport.
    pub fn local_addr(&self) -> &str {
        &self.inner.local_addr
    }

    /// Container id from the peer's `open`, once received.
    pub fn remote_container_id(&self) -> Option<String> {
        self.inner.remote_container_id.lock().clone()
    }

    /// Identity established by SASL, if any.
    pub fn identity(&self) -> Option<String> {
        self.inner.identity.lock().clone()
    }

    /// Whether the connection has terminated.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Closes the connection, sending `error` in the `close` frame.
    pub fn close(&self, error: Option<Error>) {
        self.send(Command::Close { error });
    }

    /// Waits until the connection has terminated.
    pub async fn closed(&self) {
        loop {
            let notified = self.inner.closed_notify.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }

    pub(crate) fn credit_channel_capacity(&self) -> usize {
        self.inner.credit_channel_capacity
    }

    pub(crate) fn send(&self, command: Command) -> bool {
        !self.is_closed() && self.inner.commands.send(command).is_ok()
    }

    fn set_remote_container_id(&self, container_id: String) {
        *self.inner.remote_container_id.lock() = Some(container_id);
    }

    fn mark_closed(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.closed_notify.notify_waiters();
    }
}

/// Shared state every connection of a listener needs.
#[derive(Clone)]
pub(crate) struct ConnectionContext {
    pub settings: Arc<ConnectionSettings>,
    pub container: Arc<dyn Container>,
    pub mechanisms: Arc<Vec<Arc<dyn SaslMechanism>>>,
    pub metrics: Arc<HostMetrics>,
}

/// Prepares a connection over an established transport.
///
/// Returns the handle at once; the future drives the connection to completion
/// and closes the transport.
pub(crate) fn start(
    transport: Arc<dyn Transport>,
    context: ConnectionContext,
) -> (ListenerConnection, impl Future<Output = ()> + Send + 'static) {
    let (connection, commands) = ListenerConnection::new(
        transport.peer_addr().to_string(),
        transport.local_addr().to_string(),
        context.settings.credit_channel_capacity,
    );
    let handle = connection.clone();
    let run = async move {
        context.metrics.connection_opened();
        let mut finish = Finish {
            connection: connection.clone(),
            metrics: context.metrics.clone(),
            transport: Some(transport.clone()),
        };
        match serve(transport, &connection, context, commands).await {
            Ok(()) => debug!(peer = %connection.peer_addr(), id = connection.id(), "connection finished"),
            Err(e) if is_disconnect(&e) => {
                debug!(peer = %connection.peer_addr(), id = connection.id(), "peer disconnected")
            }
            Err(e) => warn!(peer = %connection.peer_addr(), id = connection.id(), error = %e, "connection failed"),
        }
        if let Some(transport) = finish.transport.take() {
            let _ = transport.close().await;
        }
    };
    (handle, run)
}

/// Marks the connection closed when its task ends, however it ends.
struct Finish {
    connection: ListenerConnection,
    metrics: Arc<HostMetrics>,
    transport: Option<Arc<dyn Transport>>,
}

impl Drop for Finish {
    fn drop(&mut self) {
        if let Some(transport) = self.transport.take() {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    let _ = transport.close().await;
                });
            }
        }
        self.connection.mark_closed();
        self.metrics.connection_closed();
    }
}

/// Aborts the read pump when the connection task stops driving it.
struct PumpGuard(JoinHandle<()>);

impl Drop for PumpGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Runs application code on the connection task, turning a panic into `None`.
pub(crate) fn contain<T>(callback: &'static str, f: impl FnOnce() -> T) -> Option<T> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_default();
            error!(callback, panic = %message, "application callback panicked");
            None
        }
    }
}

fn is_disconnect(error: &AmqpError) -> bool {
    matches!(error, AmqpError::Transport(e) if e.is_disconnect())
}

struct Forwarder {
    frames: mpsc::Sender<Bytes>,
}

#[async_trait]
impl FrameHandler for Forwarder {
    async fn on_header(&mut self, _header: [u8; 8]) -> bool {
        false
    }

    async fn on_frame(&mut self, frame: Bytes) -> bool {
        self.frames.send(frame).await.is_ok()
    }
}

async fn serve(
    transport: Arc<dyn Transport>,
    connection: &ListenerConnection,
    context: ConnectionContext,
    commands: mpsc::UnboundedReceiver<Command>,
) -> Result<()> {
    let max_frame_size = Arc::new(AtomicU32::new(
        context.settings.max_frame_size.max(MIN_MAX_FRAME_SIZE),
    ));
    let reader = FrameReader::new(transport.clone(), max_frame_size);

    let header = tokio::time::timeout(
        context.settings.handshake_timeout(),
        handshake(&reader, &*transport, connection, &context),
    )
    .await
    .map_err(|_| AmqpError::Timeout("protocol handshake"))??;

    let writer = {
        let commands = connection.inner.commands.clone();
        Writer::new(transport.clone(), move |e| {
            let _ = commands.send(Command::IoError(e));
        })
    };

    let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE_DEPTH);
    let _pump = {
        let commands = connection.inner.commands.clone();
        PumpGuard(tokio::spawn(async move {
            let mut forwarder = Forwarder { frames: frame_tx };
            if let Err(e) = pump(reader, &mut forwarder, false).await {
                let _ = commands.send(Command::IoError(e));
            }
        }))
    };

    info!(
        peer = %connection.peer_addr(),
        id = connection.id(),
        identity = ?connection.identity(),
        "connection accepted"
    );
    let actor = ConnectionActor::new(connection.clone(), &context, writer);
    actor.run(header, frame_rx, commands).await
}

/// Exchanges protocol headers, running SASL first when mechanisms are configured.
async fn handshake(
    reader: &FrameReader,
    transport: &dyn Transport,
    connection: &ListenerConnection,
    context: &ConnectionContext,
) -> Result<ProtocolHeader> {
    let header = ProtocolHeader::parse(&reader.read_header().await?)?;
    let sasl_enabled = !context.mechanisms.is_empty();
    let expected = if sasl_enabled {
        ProtocolId::Sasl
    } else {
        ProtocolId::Amqp
    };
    if header.id != expected || !header.is_supported_version() {
        let supported = if sasl_enabled {
            ProtocolHeader::sasl()
        } else {
            ProtocolHeader::amqp()
        };
        transport.send(Bytes::copy_from_slice(&supported.to_bytes())).await?;
        return Err(AmqpError::not_allowed(format!(
            "protocol header {:?} {}.{}.{} not accepted",
            header.id, header.major, header.minor, header.revision
        )));
    }
    if !sasl_enabled {
        return Ok(header);
    }

    let mut negotiator = SaslNegotiator::new(context.mechanisms.as_ref().clone());
    match sasl::negotiate(reader, transport, &mut negotiator).await {
        Ok((identity, header)) => {
            *connection.inner.identity.lock() = identity;
            Ok(header)
        }
        Err(e) => {
            context.metrics.sasl_failed();
            Err(e)
        }
    }
}
