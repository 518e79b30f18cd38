//! Accepts transports on an address and runs an AMQP connection over each.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use amqphost_transport::{TcpTransport, TlsAcceptor, TlsTransport, Transport, WebSocketTransport};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

use crate::address::{Address, Scheme};
use crate::config::{ListenerSettings, PlainCredentials, TcpSettings};
use crate::connection::{self, ConnectionContext, ListenerConnection};
use crate::container::Container;
use crate::error::{AmqpError, Result};
use crate::metrics::{HostMetrics, MetricsSnapshot};
use crate::sasl;

static NEXT_ACCEPT_ID: AtomicU64 = AtomicU64::new(1);

/// Pause after a failed accept, e.g. when out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

enum Tracked {
    Handshake(AbortHandle),
    Connection(ListenerConnection),
}

type TrackedMap = Arc<Mutex<HashMap<u64, Tracked>>>;

/// Drops an accepted socket's entry when its task ends or is aborted.
struct Untrack {
    tracked: TrackedMap,
    id: u64,
}

impl Drop for Untrack {
    fn drop(&mut self) {
        self.tracked.lock().remove(&self.id);
    }
}

/// Per-socket accept state, cloned into each accept loop.
#[derive(Clone)]
struct Acceptor {
    address: Arc<Address>,
    context: ConnectionContext,
    tls: Option<Arc<TlsAcceptor>>,
    tcp: TcpSettings,
    tracked: TrackedMap,
}

impl Acceptor {
    async fn run(self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let id = NEXT_ACCEPT_ID.fetch_add(1, Ordering::Relaxed);
                    debug!(address = %self.address, peer = %peer, "socket accepted");
                    let acceptor = self.clone();
                    let mut tracked = self.tracked.lock();
                    let task = tokio::spawn(acceptor.serve(id, stream));
                    tracked.insert(id, Tracked::Handshake(task.abort_handle()));
                }
                Err(e) => {
                    warn!(address = %self.address, error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }

    async fn serve(self, id: u64, stream: TcpStream) {
        let _untrack = Untrack {
            tracked: self.tracked.clone(),
            id,
        };
        let timeout = self.context.settings.handshake_timeout();
        let transport = match tokio::time::timeout(timeout, self.upgrade(stream)).await {
            Ok(Ok(transport)) => transport,
            Ok(Err(e)) => {
                warn!(address = %self.address, error = %e, "transport handshake failed");
                return;
            }
            Err(_) => {
                warn!(address = %self.address, "transport handshake timed out");
                return;
            }
        };

        let (connection, run) = connection::start(transport.clone(), self.context.clone());
        let registered = {
            let mut tracked = self.tracked.lock();
            match tracked.get_mut(&id) {
                Some(entry) => {
                    *entry = Tracked::Connection(connection);
                    true
                }
                None => false,
            }
        };
        if !registered {
            // Listener closed while the transport handshake was running.
            let _ = transport.close().await;
            return;
        }
        run.await;
    }

    async fn upgrade(&self, stream: TcpStream) -> Result<Arc<dyn Transport>> {
        let peer_addr = stream.peer_addr().map(|a| a.to_string()).unwrap_or_default();
        let local_addr = stream.local_addr().map(|a| a.to_string()).unwrap_or_default();
        if self.address.scheme != Scheme::Amqp && self.tcp.nodelay {
            stream.set_nodelay(true)?;
        }
        let transport: Arc<dyn Transport> = match self.address.scheme {
            Scheme::Amqp => Arc::new(TcpTransport::from_stream(stream, &self.tcp)?),
            Scheme::Amqps => {
                let tls = self.tls()?.accept(stream).await?;
                Arc::new(TlsTransport::new(tls, peer_addr, local_addr))
            }
            Scheme::Ws => Arc::new(
                WebSocketTransport::accept(stream, &self.address.path, peer_addr, local_addr, None).await?,
            ),
            Scheme::Wss => {
                let tls = self.tls()?.accept(stream).await?;
                let certificates = tls.peer_certificates();
                Arc::new(
                    WebSocketTransport::accept(
                        tls,
                        &self.address.path,
                        peer_addr,
                        local_addr,
                        certificates,
                    )
                    .await?,
                )
            }
        };
        Ok(transport)
    }

    fn tls(&self) -> Result<&TlsAcceptor> {
        self.tls.as_deref().ok_or_else(|| AmqpError::Config {
            reason: format!("{} requires TLS settings", self.address),
        })
    }
}

/// Listens on one address (`amqp`, `amqps`, `ws` or `wss`) and serves
/// every accepted connection with a [`Container`].
pub struct ConnectionListener {
    acceptor: Acceptor,
    metrics: Arc<HostMetrics>,
    local_addrs: Vec<SocketAddr>,
    accept_tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for ConnectionListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionListener")
            .field("address", &self.acceptor.address.to_string())
            .field("local_addrs", &self.local_addrs)
            .field("open", &self.is_open())
            .finish()
    }
}

impl ConnectionListener {
    /// Creates a listener; nothing is bound until [`open`](Self::open).
    ///
    /// User info in the address enables SASL PLAIN with those credentials.
    pub fn new(address: &str, settings: ListenerSettings, container: Arc<dyn Container>) -> Result<Self> {
        Self::with_metrics(address, settings, container, Arc::new(HostMetrics::new()))
    }

    pub(crate) fn with_metrics(
        address: &str,
        settings: ListenerSettings,
        container: Arc<dyn Container>,
        metrics: Arc<HostMetrics>,
    ) -> Result<Self> {
        let address = Address::parse(address)?;
        let tls = if address.scheme.is_secure() {
            let config = settings.tls.as_ref().ok_or_else(|| AmqpError::Config {
                reason: format!("{} requires TLS settings", address),
            })?;
            Some(Arc::new(TlsAcceptor::new(
                config,
                settings.certificate_validator.clone(),
            )?))
        } else {
            None
        };
        let credentials = address.user.clone().map(|user| PlainCredentials {
            user,
            password: address.password.clone().unwrap_or_default(),
        });
        let mechanisms = sasl::mechanisms(&settings.sasl, credentials);

        Ok(Self {
            acceptor: Acceptor {
                address: Arc::new(address),
                context: ConnectionContext {
                    settings: Arc::new(settings.connection),
                    container,
                    mechanisms: Arc::new(mechanisms),
                    metrics: metrics.clone(),
                },
                tls,
                tcp: settings.tcp,
                tracked: Arc::new(Mutex::new(HashMap::new())),
            },
            metrics,
            local_addrs: Vec::new(),
            accept_tasks: Vec::new(),
        })
    }

    /// The listen address.
    pub fn address(&self) -> &Address {
        &self.acceptor.address
    }

    /// Bound socket addresses; resolves port zero to the ephemeral port.
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    /// Whether the listener is accepting.
    pub fn is_open(&self) -> bool {
        !self.accept_tasks.is_empty()
    }

    /// Connections currently running.
    pub fn connections(&self) -> Vec<ListenerConnection> {
        self.acceptor
            .tracked
            .lock()
            .values()
            .filter_map(|t| match t {
                Tracked::Connection(c) => Some(c.clone()),
                Tracked::Handshake(_) => None,
            })
            .collect()
    }

    /// Counters of this listener's connections.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Binds the address and starts accepting.
    pub async fn open(&mut self) -> Result<()> {
        if self.is_open() {
            return Err(AmqpError::not_allowed("listener is already open"));
        }
        let listeners = bind(&self.acceptor.address).await?;
        for listener in listeners {
            self.local_addrs.push(listener.local_addr()?);
            self.accept_tasks
                .push(tokio::spawn(self.acceptor.clone().run(listener)));
        }
        info!(
            address = %self.acceptor.address,
            local_addrs = ?self.local_addrs,
            "listener opened"
        );
        Ok(())
    }

    /// Stops accepting, aborts pending handshakes and closes live connections.
    pub async fn close(&mut self) -> Result<()> {
        for task in self.accept_tasks.drain(..) {
            task.abort();
        }
        self.local_addrs.clear();

        let tracked = std::mem::take(&mut *self.acceptor.tracked.lock());
        let mut connections = Vec::new();
        for (_, entry) in tracked {
            match entry {
                Tracked::Handshake(task) => task.abort(),
                Tracked::Connection(connection) => {
                    connection.close(None);
                    connections.push(connection);
                }
            }
        }
        let closing = futures::future::join_all(connections.iter().map(ListenerConnection::closed));
        let timeout = self.acceptor.context.settings.close_timeout();
        if tokio::time::timeout(timeout, closing).await.is_err() {
            warn!(address = %self.acceptor.address, "connections did not close in time");
        }
        info!(address = %self.acceptor.address, "listener closed");
        Ok(())
    }
}

impl Drop for ConnectionListener {
    fn drop(&mut self) {
        for task in &self.accept_tasks {
            task.abort();
        }
    }
}

/// Binds every socket the address names.
///
/// `localhost` binds the IPv4 and, when available, IPv6 wildcard; an IP
/// literal binds itself; other names bind every resolved address.
async fn bind(address: &Address) -> Result<Vec<TcpListener>> {
    if address.host.eq_ignore_ascii_case("localhost") {
        let v4 = TcpListener::bind((Ipv4Addr::UNSPECIFIED, address.port)).await?;
        let port = v4.local_addr()?.port();
        let mut listeners = vec![v4];
        match TcpListener::bind((Ipv6Addr::UNSPECIFIED, port)).await {
            Ok(v6) => listeners.push(v6),
            Err(e) => debug!(port, error = %e, "IPv6 wildcard not bound"),
        }
        return Ok(listeners);
    }
    if let Ok(ip) = address.host.parse::<IpAddr>() {
        return Ok(vec![TcpListener::bind((ip, address.port)).await?]);
    }
    let resolved: Vec<SocketAddr> = tokio::net::lookup_host(address.host_port()).await?.collect();
    if resolved.is_empty() {
        return Err(AmqpError::InvalidAddress {
            address: address.to_string(),
            reason: "host name did not resolve".to_string(),
        });
    }
    let mut listeners = Vec::with_capacity(resolved.len());
    for addr in resolved {
        listeners.push(TcpListener::bind(addr).await?);
    }
    Ok(listeners)
}
