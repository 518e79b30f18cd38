//! WebSocket transport for `ws` and `wss` listeners.
//!
//! Every AMQP buffer travels as one binary message. Peers must offer the
//! `AMQPWSB10` sub-protocol during the upgrade.

use async_trait::async_trait;
use bytes::{Buf, Bytes};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::error::{Result, TransportError};
use crate::transport::{CloseSignal, Transport};

/// Sub-protocol token for AMQP over WebSocket.
pub const AMQP_SUBPROTOCOL: &str = "AMQPWSB10";

const SUBPROTOCOL_HEADER: &str = "Sec-WebSocket-Protocol";

struct ReadState<S> {
    stream: SplitStream<WebSocketStream<S>>,
    pending: Bytes,
    eof: bool,
}

/// Transport over an upgraded WebSocket connection.
pub struct WebSocketTransport<S> {
    sink: Mutex<SplitSink<WebSocketStream<S>, Message>>,
    read: Mutex<ReadState<S>>,
    close: CloseSignal,
    peer_addr: String,
    local_addr: String,
    peer_certificates: Option<Vec<Vec<u8>>>,
}

fn offers_amqp(request: &Request) -> bool {
    request
        .headers()
        .get_all(SUBPROTOCOL_HEADER)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|p| p.trim() == AMQP_SUBPROTOCOL)
}

fn reject(status: StatusCode, reason: String) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason));
    *response.status_mut() = status;
    response
}

impl<S> WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Runs the server side of the upgrade.
    ///
    /// `path` is the expected request path; `/` accepts any path.
    pub async fn accept(
        stream: S,
        path: &str,
        peer_addr: String,
        local_addr: String,
        peer_certificates: Option<Vec<Vec<u8>>>,
    ) -> Result<Self> {
        let expected = path.to_string();
        let callback = move |request: &Request, mut response: Response| {
            let requested = request.uri().path();
            if expected != "/" && requested != expected {
                return Err(reject(StatusCode::NOT_FOUND, format!("unknown path {}", requested)));
            }
            if !offers_amqp(request) {
                return Err(reject(
                    StatusCode::BAD_REQUEST,
                    format!("sub-protocol {} required", AMQP_SUBPROTOCOL),
                ));
            }
            response
                .headers_mut()
                .insert(SUBPROTOCOL_HEADER, HeaderValue::from_static(AMQP_SUBPROTOCOL));
            Ok(response)
        };

        let ws = tokio_tungstenite::accept_hdr_async(stream, callback)
            .await
            .map_err(|e| TransportError::WebSocketError {
                reason: format!("upgrade failed: {}", e),
            })?;
        tracing::debug!(peer = %peer_addr, "WebSocket upgraded");
        Ok(Self::from_stream(ws, peer_addr, local_addr, peer_certificates))
    }

    /// Runs the client side of the upgrade against `url`, offering `AMQPWSB10`.
    pub async fn connect(stream: S, url: &str, peer_addr: String, local_addr: String) -> Result<Self> {
        let ws_error = |e: tokio_tungstenite::tungstenite::Error| TransportError::WebSocketError {
            reason: format!("upgrade failed: {}", e),
        };
        let mut request = url.into_client_request().map_err(ws_error)?;
        request
            .headers_mut()
            .insert(SUBPROTOCOL_HEADER, HeaderValue::from_static(AMQP_SUBPROTOCOL));
        let (ws, _) = tokio_tungstenite::client_async(request, stream)
            .await
            .map_err(ws_error)?;
        Ok(Self::from_stream(ws, peer_addr, local_addr, None))
    }

    fn from_stream(
        ws: WebSocketStream<S>,
        peer_addr: String,
        local_addr: String,
        peer_certificates: Option<Vec<Vec<u8>>>,
    ) -> Self {
        let (sink, stream) = ws.split();
        Self {
            sink: Mutex::new(sink),
            read: Mutex::new(ReadState {
                stream,
                pending: Bytes::new(),
                eof: false,
            }),
            close: CloseSignal::default(),
            peer_addr,
            local_addr,
            peer_certificates,
        }
    }
}

impl<S> ReadState<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    async fn read_into(&mut self, buf: &mut [u8]) -> Result<usize> {
        while self.pending.is_empty() {
            if self.eof {
                return Ok(0);
            }
            match self.stream.next().await {
                Some(Ok(Message::Binary(data))) => self.pending = Bytes::from(data),
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                Some(Ok(Message::Text(_))) => {
                    return Err(TransportError::WebSocketError {
                        reason: "text messages are not supported".to_string(),
                    })
                }
                Some(Ok(Message::Close(_))) | None => self.eof = true,
                Some(Err(e)) => {
                    return Err(TransportError::WebSocketError {
                        reason: e.to_string(),
                    })
                }
            }
        }
        let n = self.pending.len().min(buf.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.advance(n);
        Ok(n)
    }
}

#[async_trait]
impl<S> Transport for WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&self, buf: Bytes) -> Result<()> {
        if self.close.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut sink = self.sink.lock().await;
        tokio::select! {
            result = sink.send(Message::Binary(buf.to_vec())) => result.map_err(|e| TransportError::WebSocketError {
                reason: e.to_string(),
            }),
            _ = self.close.closed() => Err(TransportError::Closed),
        }
    }

    async fn receive(&self, buf: &mut [u8]) -> Result<usize> {
        if self.close.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut read = self.read.lock().await;
        tokio::select! {
            result = read.read_into(buf) => result,
            _ = self.close.closed() => Err(TransportError::Closed),
        }
    }

    async fn close(&self) -> Result<()> {
        if self.close.close() {
            let mut sink = self.sink.lock().await;
            if let Err(e) = sink.close().await {
                tracing::debug!(peer = %self.peer_addr, error = %e, "WebSocket close failed");
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

    fn peer_certificates(&self) -> Option<Vec<Vec<u8>>> {
        self.peer_certificates.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    async fn upgrade(
        path: &'static str,
        url: String,
        offer: bool,
    ) -> (Result<WebSocketTransport<TcpStream>>, Result<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            WebSocketTransport::accept(stream, path, peer.to_string(), addr.to_string(), None).await
        });
        let stream = TcpStream::connect(addr).await.unwrap();
        let url = url.replace("{addr}", &addr.to_string());
        let client = if offer {
            WebSocketTransport::connect(stream, &url, addr.to_string(), String::new())
                .await
                .map(|client| {
                    tokio::spawn(async move {
                        client.send(Bytes::from_static(b"AMQP\x00\x01\x00\x00")).await.unwrap();
                        let mut buf = [0u8; 3];
                        let n = client.receive(&mut buf).await.unwrap();
                        assert_eq!(&buf[..n], b"ack");
                    });
                })
        } else {
            tokio_tungstenite::client_async(url.as_str(), stream)
                .await
                .map(|_| ())
                .map_err(|e| TransportError::WebSocketError { reason: e.to_string() })
        };
        (server.await.unwrap(), client)
    }

    #[tokio::test]
    async fn test_binary_messages_read_in_pieces() {
        let (server, client) = upgrade("/", "ws://{addr}/amqp".to_string(), true).await;
        client.unwrap();
        let server = server.unwrap();
        let mut header = Vec::new();
        while header.len() < 8 {
            let mut buf = [0u8; 3];
            let n = server.receive(&mut buf).await.unwrap();
            header.extend_from_slice(&buf[..n]);
        }
        assert_eq!(header, b"AMQP\x00\x01\x00\x00");
        server.send(Bytes::from_static(b"ack")).await.unwrap();
        server.close().await.unwrap();
        server.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_subprotocol_rejected() {
        let (server, client) = upgrade("/", "ws://{addr}/".to_string(), false).await;
        assert!(matches!(server, Err(TransportError::WebSocketError { .. })));
        assert!(client.is_err());
    }

    #[tokio::test]
    async fn test_wrong_path_rejected() {
        let (server, client) = upgrade("/amqp", "ws://{addr}/other".to_string(), true).await;
        assert!(server.is_err());
        assert!(client.is_err());
    }
}
