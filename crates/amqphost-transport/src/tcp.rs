//! TCP transport implementation

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::error::{Result, TransportError};
use crate::iops::{IopsConfig, IopsTracker};
use crate::transport::{write_all_vectored, CloseSignal, Transport};

/// TCP transport configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpTransportConfig {
    /// Connection timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Whether to enable TCP_NODELAY (disable Nagle's algorithm).
    pub nodelay: bool,
    /// Adaptive receive buffering.
    pub iops: IopsConfig,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5000,
            nodelay: true,
            iops: IopsConfig::default(),
        }
    }
}

struct Prefetch {
    buf: Box<[u8]>,
    start: usize,
    end: usize,
}

struct ReadState {
    half: OwnedReadHalf,
    tracker: IopsTracker,
    prefetch_size: usize,
    want_prefetch: bool,
    prefetch: Option<Prefetch>,
}

impl ReadState {
    async fn read_into(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.tracker.track_one() {
            self.want_prefetch = self.tracker.level() > 0;
            if self.want_prefetch && self.prefetch.is_none() {
                self.prefetch = Some(Prefetch {
                    buf: vec![0u8; self.prefetch_size].into_boxed_slice(),
                    start: 0,
                    end: 0,
                });
            }
        }

        if let Some(p) = &mut self.prefetch {
            if p.start < p.end {
                return Ok(copy_out(p, buf));
            }
        }
        // Buffered bytes are drained before the prefetch buffer is dropped.
        if !self.want_prefetch {
            self.prefetch = None;
        }

        match &mut self.prefetch {
            Some(p) if buf.len() < p.buf.len() => {
                let read = self.half.read(&mut p.buf).await?;
                p.start = 0;
                p.end = read;
                Ok(copy_out(p, buf))
            }
            _ => self.half.read(buf).await,
        }
    }
}

fn copy_out(p: &mut Prefetch, buf: &mut [u8]) -> usize {
    let n = (p.end - p.start).min(buf.len());
    buf[..n].copy_from_slice(&p.buf[p.start..p.start + n]);
    p.start += n;
    n
}

/// A TCP connection carrying AMQP frames.
///
/// Receives go through an [`IopsTracker`]; while it reports a busy connection,
/// small reads are served from a prefetch buffer filled by larger socket reads.
pub struct TcpTransport {
    read: Mutex<ReadState>,
    write: Mutex<OwnedWriteHalf>,
    close: CloseSignal,
    peer_addr: String,
    local_addr: String,
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("peer_addr", &self.peer_addr)
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

impl TcpTransport {
    /// Establishes a TCP connection to the specified address.
    pub async fn connect(addr: &str, config: &TcpTransportConfig) -> Result<Self> {
        let timeout = std::time::Duration::from_millis(config.connect_timeout_ms);
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::ConnectionTimeout {
                addr: addr.to_string(),
                timeout_ms: config.connect_timeout_ms,
            })?
            .map_err(TransportError::IoError)?;
        tracing::debug!(addr = addr, "TCP connected");
        Self::from_stream(stream, config)
    }

    /// Wraps an accepted or connected stream.
    pub fn from_stream(stream: TcpStream, config: &TcpTransportConfig) -> Result<Self> {
        if config.nodelay {
            stream.set_nodelay(true).map_err(TransportError::IoError)?;
        }
        let peer_addr = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let local_addr = stream
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let (read, write) = stream.into_split();
        Ok(Self {
            read: Mutex::new(ReadState {
                half: read,
                tracker: IopsTracker::new(&config.iops),
                prefetch_size: config.iops.prefetch_size,
                want_prefetch: false,
                prefetch: None,
            }),
            write: Mutex::new(write),
            close: CloseSignal::default(),
            peer_addr,
            local_addr,
        })
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, buf: Bytes) -> Result<()> {
        if self.close.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut write = self.write.lock().await;
        tokio::select! {
            result = write.write_all(&buf) => result.map_err(TransportError::IoError),
            _ = self.close.closed() => Err(TransportError::Closed),
        }
    }

    async fn send_vectored(&self, bufs: Vec<Bytes>) -> Result<()> {
        if self.close.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut write = self.write.lock().await;
        tokio::select! {
            result = write_all_vectored(&mut *write, bufs) => result.map_err(TransportError::IoError),
            _ = self.close.closed() => Err(TransportError::Closed),
        }
    }

    async fn receive(&self, buf: &mut [u8]) -> Result<usize> {
        if self.close.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut read = self.read.lock().await;
        tokio::select! {
            result = read.read_into(buf) => result.map_err(TransportError::IoError),
            _ = self.close.closed() => Err(TransportError::Closed),
        }
    }

    async fn close(&self) -> Result<()> {
        if self.close.close() {
            let mut write = self.write.lock().await;
            if let Err(e) = write.shutdown().await {
                tracing::debug!(peer = %self.peer_addr, error = %e, "TCP shutdown failed");
            }
        }
        Ok(())
    }

    fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    fn local_addr(&self) -> &str {
        &self.local_addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn pair(config: TcpTransportConfig) -> (TcpTransport, TcpTransport) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        let client = TcpTransport::connect(&addr, &config).await.unwrap();
        let server = TcpTransport::from_stream(accept.await.unwrap(), &config).unwrap();
        (client, server)
    }

    async fn read_exact(t: &TcpTransport, len: usize, chunk: usize) -> Vec<u8> {
        let mut out = Vec::new();
        while out.len() < len {
            let mut buf = vec![0u8; chunk.min(len - out.len())];
            let n = t.receive(&mut buf).await.unwrap();
            assert!(n > 0);
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    #[tokio::test]
    async fn test_send_receive_and_vectored() {
        let (client, server) = pair(TcpTransportConfig::default()).await;
        client.send(Bytes::from_static(b"hello ")).await.unwrap();
        client
            .send_vectored(vec![Bytes::from_static(b"wor"), Bytes::from_static(b"ld")])
            .await
            .unwrap();
        assert_eq!(read_exact(&server, 11, 64).await, b"hello world");
        assert!(!server.peer_addr().is_empty());
        assert_eq!(server.peer_addr(), client.local_addr());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_peer_sees_eof() {
        let (client, server) = pair(TcpTransportConfig::default()).await;
        client.close().await.unwrap();
        client.close().await.unwrap();
        assert!(matches!(
            client.send(Bytes::from_static(b"x")).await,
            Err(TransportError::Closed)
        ));
        let mut buf = [0u8; 4];
        assert_eq!(server.receive(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_close_wakes_pending_receive() {
        let (_client, server) = pair(TcpTransportConfig::default()).await;
        let server = std::sync::Arc::new(server);
        let reader = {
            let server = server.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 4];
                server.receive(&mut buf).await
            })
        };
        tokio::task::yield_now().await;
        server.close().await.unwrap();
        assert!(matches!(reader.await.unwrap(), Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_prefetch_preserves_byte_stream() {
        let config = TcpTransportConfig {
            iops: IopsConfig {
                window_ms: 0,
                thresholds: vec![1],
                prefetch_size: 64,
            },
            ..Default::default()
        };
        let (client, server) = pair(config).await;
        let data: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
        client.send(Bytes::from(data.clone())).await.unwrap();
        let received = read_exact(&server, data.len(), 7).await;
        assert_eq!(received, data);
        assert!(server.read.lock().await.prefetch.is_some());
    }
}
