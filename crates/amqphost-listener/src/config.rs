//! Listener and host configuration.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use amqphost_transport::{CertificateValidator, TlsConfig};
use serde::{Deserialize, Serialize};

use crate::error::{AmqpError, Result};

pub use amqphost_transport::{IopsConfig, TcpTransportConfig as TcpSettings};

/// Per-connection protocol limits and timers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Container id sent in `open`; a random one is generated when unset.
    pub container_id: Option<String>,
    /// Largest frame accepted and sent.
    pub max_frame_size: u32,
    /// Highest channel number a peer may begin a session on.
    pub channel_max: u16,
    /// Highest link handle per session.
    pub handle_max: u32,
    /// Session incoming window, in transfers.
    pub incoming_window: u32,
    /// Session outgoing window, in transfers.
    pub outgoing_window: u32,
    /// Close the connection when nothing arrives for this long. Advertised in `open`.
    pub idle_timeout_ms: Option<u32>,
    /// How long an attach may stay pending before it is failed.
    pub attach_timeout_ms: u64,
    /// How long to wait for the peer's `close` after sending ours.
    pub close_timeout_ms: u64,
    /// Time allowed for the TLS, WebSocket and SASL handshakes.
    pub handshake_timeout_ms: u64,
    /// Capacity of a sender link's credit channel.
    pub credit_channel_capacity: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            container_id: None,
            max_frame_size: 256 * 1024,
            channel_max: 255,
            handle_max: 255,
            incoming_window: 2048,
            outgoing_window: 2048,
            idle_timeout_ms: None,
            attach_timeout_ms: 30_000,
            close_timeout_ms: 5_000,
            handshake_timeout_ms: 10_000,
            credit_channel_capacity: 16,
        }
    }
}

impl ConnectionSettings {
    pub(crate) fn attach_timeout(&self) -> Duration {
        Duration::from_millis(self.attach_timeout_ms)
    }

    pub(crate) fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub(crate) fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub(crate) fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_ms
            .filter(|ms| *ms > 0)
            .map(|ms| Duration::from_millis(ms as u64))
    }
}

/// Credentials accepted by the PLAIN mechanism.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlainCredentials {
    /// Authentication identity.
    pub user: String,
    /// Password.
    pub password: String,
}

/// SASL mechanisms offered by a listener. Nothing configured means no SASL layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SaslSettings {
    /// Enables PLAIN with these credentials. User info in the listen address takes precedence.
    pub plain: Option<PlainCredentials>,
    /// Enables EXTERNAL, which authenticates by TLS client certificate.
    pub external: bool,
}

/// TLS material loaded from PEM files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsSettings {
    /// Certificate chain of the listener.
    pub cert_file: PathBuf,
    /// Private key of the listener certificate.
    pub key_file: PathBuf,
    /// CA certificates that client certificates must chain to.
    #[serde(default)]
    pub client_ca_file: Option<PathBuf>,
    /// Whether clients must present a certificate.
    #[serde(default)]
    pub require_client_cert: bool,
}

fn read_pem(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| AmqpError::Config {
        reason: format!("cannot read {}: {}", path.display(), e),
    })
}

impl TlsSettings {
    /// Reads the configured files.
    pub fn load(&self) -> Result<TlsConfig> {
        Ok(TlsConfig {
            cert_chain_pem: read_pem(&self.cert_file)?,
            private_key_pem: read_pem(&self.key_file)?,
            client_ca_pem: self.client_ca_file.as_deref().map(read_pem).transpose()?,
            require_client_cert: self.require_client_cert,
        })
    }
}

/// Everything a [`crate::ConnectionListener`] needs besides its address.
#[derive(Clone, Default)]
pub struct ListenerSettings {
    /// Protocol limits and timers.
    pub connection: ConnectionSettings,
    /// TCP socket options and receive buffering.
    pub tcp: TcpSettings,
    /// TLS material; required for `amqps` and `wss`.
    pub tls: Option<TlsConfig>,
    /// Application check of client certificates, replacing CA validation.
    pub certificate_validator: Option<Arc<dyn CertificateValidator>>,
    /// SASL mechanisms.
    pub sasl: SaslSettings,
}

impl std::fmt::Debug for ListenerSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerSettings")
            .field("connection", &self.connection)
            .field("tcp", &self.tcp)
            .field("tls", &self.tls.is_some())
            .field("certificate_validator", &self.certificate_validator.is_some())
            .field("sasl", &self.sasl)
            .finish()
    }
}

/// Configuration of the `amqphost` daemon, usually read from TOML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Listen addresses, one listener each.
    pub listen: Vec<String>,
    /// Node addresses served by the logging message processor.
    pub nodes: Vec<String>,
    /// Credit granted on each node link.
    pub node_credit: u32,
    /// Protocol limits and timers.
    pub connection: ConnectionSettings,
    /// TCP socket options and receive buffering.
    pub tcp: TcpSettings,
    /// TLS files for `amqps` and `wss` listeners.
    pub tls: Option<TlsSettings>,
    /// SASL mechanisms.
    pub sasl: SaslSettings,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            listen: vec!["amqp://localhost:5672".to_string()],
            nodes: Vec::new(),
            node_credit: 100,
            connection: ConnectionSettings::default(),
            tcp: TcpSettings::default(),
            tls: None,
            sasl: SaslSettings::default(),
        }
    }
}

impl HostConfig {
    /// Parses a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| AmqpError::Config {
            reason: format!("invalid configuration: {}", e),
        })
    }

    /// Reads and parses a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| AmqpError::Config {
            reason: format!("cannot read {}: {}", path.display(), e),
        })?;
        Self::from_toml_str(&text)
    }

    /// Listener settings with TLS files loaded.
    pub fn listener_settings(&self) -> Result<ListenerSettings> {
        Ok(ListenerSettings {
            connection: self.connection.clone(),
            tcp: self.tcp.clone(),
            tls: self.tls.as_ref().map(TlsSettings::load).transpose()?,
            certificate_validator: None,
            sasl: self.sasl.clone(),
        })
    }
}
