//! Frame-level AMQP 1.0 client used to drive a host from the outside.
//!
//! The client sends exactly the performatives a test asks for, so protocol
//! violations and odd orderings can be produced as easily as normal traffic.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use amqphost_transport::{
    FrameReader, TcpTransport, TcpTransportConfig, TlsConnector, TlsTransport, Transport,
    WebSocketTransport,
};
use amqphost_types::{
    decode_frame, encode_frame, encode_sasl_frame, encode_transfer, Attach, Begin, Flow,
    Frame, FrameBody, Message, Open, Performative, ProtocolHeader, Role, SaslCode, SaslFrame,
    SaslInit, Source, Symbol, Target, Transfer,
};
use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;

/// How long a test waits for the host to produce a frame.
pub const RECEIVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest frame the client accepts and the size it splits transfers at.
pub const CLIENT_MAX_FRAME_SIZE: u32 = 512;

/// Session windows the client advertises.
const WINDOW: u32 = 2048;

/// Opens a plain TCP transport to `addr`.
pub async fn tcp(addr: SocketAddr) -> Result<Arc<dyn Transport>> {
    let transport = TcpTransport::connect(&addr.to_string(), &TcpTransportConfig::default()).await?;
    Ok(Arc::new(transport))
}

/// Opens a TLS transport to `addr`, trusting `ca_pem` and expecting `server_name`.
pub async fn tls(addr: SocketAddr, ca_pem: &[u8], server_name: &str) -> Result<Arc<dyn Transport>> {
    let stream = tokio::net::TcpStream::connect(addr).await?;
    let local = stream.local_addr()?.to_string();
    let tls = TlsConnector::new(ca_pem, None)?.connect(server_name, stream).await?;
    Ok(Arc::new(TlsTransport::new(tls, addr.to_string(), local)))
}

/// Opens a WebSocket transport to `ws://addr{path}` offering `AMQPWSB10`.
pub async fn websocket(addr: SocketAddr, path: &str) -> Result<Arc<dyn Transport>> {
    let stream = tokio::net::TcpStream::connect(addr).await?;
    let local = stream.local_addr()?.to_string();
    let url = format!("ws://{}{}", addr, path);
    let transport = WebSocketTransport::connect(stream, &url, addr.to_string(), local).await?;
    Ok(Arc::new(transport))
}

/// Runs the client side of a SASL exchange and returns the outcome code.
///
/// On `SaslCode::Ok` the transport is ready for [`TestClient::open`].
pub async fn sasl(transport: &Arc<dyn Transport>, init: SaslInit) -> Result<SaslCode> {
    let mechanism = init.mechanism.clone();
    sasl_exchange(transport, SaslFrame::Init(init), Some(&mechanism)).await
}

/// Opens the SASL layer but sends `first` in place of a `sasl-init`,
/// returning the outcome the host answers with.
pub async fn sasl_out_of_order(transport: &Arc<dyn Transport>, first: SaslFrame) -> Result<SaslCode> {
    sasl_exchange(transport, first, None).await
}

async fn sasl_exchange(
    transport: &Arc<dyn Transport>,
    first: SaslFrame,
    mechanism: Option<&Symbol>,
) -> Result<SaslCode> {
    let reader = FrameReader::new(transport.clone(), Arc::new(AtomicU32::new(CLIENT_MAX_FRAME_SIZE)));
    transport
        .send(Bytes::copy_from_slice(&ProtocolHeader::sasl().to_bytes()))
        .await?;
    let header = ProtocolHeader::parse(&timed(reader.read_header()).await??)?;
    if header != ProtocolHeader::sasl() {
        bail!("host answered with {:?}", header);
    }

    let offered = match decode_frame(timed(reader.read_frame()).await??)?.body {
        FrameBody::Sasl(SaslFrame::Mechanisms(m)) => m.mechanisms,
        other => bail!("expected sasl-mechanisms, got {:?}", other),
    };
    if let Some(mechanism) = mechanism {
        if !offered.contains(mechanism) {
            bail!("{} not offered in {:?}", mechanism, offered);
        }
    }
    transport.send(encode_sasl_frame(&first)).await?;

    match decode_frame(timed(reader.read_frame()).await??)?.body {
        FrameBody::Sasl(SaslFrame::Outcome(outcome)) => Ok(outcome.code),
        other => bail!("expected sasl-outcome, got {:?}", other),
    }
}

/// A `sasl-init` for PLAIN with an empty authorization identity.
pub fn plain_init(user: &str, password: &str) -> SaslInit {
    let mut response = Vec::with_capacity(user.len() + password.len() + 2);
    response.push(0);
    response.extend_from_slice(user.as_bytes());
    response.push(0);
    response.extend_from_slice(password.as_bytes());
    SaslInit {
        mechanism: Symbol::from("PLAIN"),
        initial_response: Some(Bytes::from(response)),
        hostname: None,
    }
}

async fn timed<F: std::future::Future>(future: F) -> Result<F::Output> {
    tokio::time::timeout(RECEIVE_TIMEOUT, future)
        .await
        .map_err(|_| anyhow!("no frame within {:?}", RECEIVE_TIMEOUT))
}

/// An attach from the client's sending side.
pub fn sender(name: &str, handle: u32, target: &str) -> Attach {
    let mut attach = Attach::new(name, handle, Role::Sender);
    attach.source = Some(Source::with_address(name));
    attach.target = Some(Target::with_address(target));
    attach.initial_delivery_count = Some(0);
    attach
}

/// An attach from the client's receiving side.
pub fn receiver(name: &str, handle: u32, source: &str, target: &str) -> Attach {
    let mut attach = Attach::new(name, handle, Role::Receiver);
    attach.source = Some(Source::with_address(source));
    attach.target = Some(Target::with_address(target));
    attach
}

/// An open AMQP connection, past the header and `open` exchange.
pub struct TestClient {
    transport: Arc<dyn Transport>,
    reader: FrameReader,
    remote_open: Open,
    transfers_sent: AtomicU32,
}

impl std::fmt::Debug for TestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestClient")
            .field("peer", &self.transport.peer_addr())
            .field("remote_container", &self.remote_open.container_id)
            .finish()
    }
}

impl TestClient {
    /// Exchanges AMQP headers and `open` frames.
    pub async fn open(transport: Arc<dyn Transport>) -> Result<Self> {
        let reader = FrameReader::new(transport.clone(), Arc::new(AtomicU32::new(CLIENT_MAX_FRAME_SIZE)));
        transport
            .send(Bytes::copy_from_slice(&ProtocolHeader::amqp().to_bytes()))
            .await?;
        let header = ProtocolHeader::parse(&timed(reader.read_header()).await??)?;
        if header != ProtocolHeader::amqp() {
            bail!("host answered with {:?}", header);
        }

        let mut open = Open::new("amqphost-test-client");
        open.max_frame_size = CLIENT_MAX_FRAME_SIZE;
        let mut client = Self {
            transport,
            reader,
            remote_open: Open::new(""),
            transfers_sent: AtomicU32::new(0),
        };
        client.send(0, Performative::Open(open)).await?;
        client.remote_open = client
            .expect(|_, p| match p {
                Performative::Open(open) => Some(open.clone()),
                _ => None,
            })
            .await?;
        Ok(client)
    }

    /// The host's `open`.
    pub fn remote_open(&self) -> &Open {
        &self.remote_open
    }

    /// Sends a raw buffer.
    pub async fn send_raw(&self, buf: Bytes) -> Result<()> {
        self.transport.send(buf).await?;
        Ok(())
    }

    /// Sends one performative without payload.
    pub async fn send(&self, channel: u16, performative: Performative) -> Result<()> {
        self.send_raw(encode_frame(channel, &performative, &[])).await
    }

    /// Receives the next non-empty frame.
    pub async fn recv(&self) -> Result<Frame> {
        loop {
            let frame = decode_frame(timed(self.reader.read_frame()).await??)?;
            if frame.body != FrameBody::Empty {
                return Ok(frame);
            }
        }
    }

    /// Receives frames until `select` picks one, skipping the rest.
    pub async fn expect<T>(&self, select: impl Fn(u16, &Performative) -> Option<T>) -> Result<T> {
        loop {
            let frame = self.recv().await?;
            match &frame.body {
                FrameBody::Amqp(performative) => {
                    if let Some(found) = select(frame.channel, performative) {
                        return Ok(found);
                    }
                    tracing::debug!(performative = performative.name(), "skipped");
                }
                other => bail!("unexpected frame {:?}", other),
            }
        }
    }

    /// Begins a session on `channel` and returns the host's channel for it.
    pub async fn begin(&self, channel: u16) -> Result<u16> {
        self.send(
            channel,
            Performative::Begin(Begin {
                remote_channel: None,
                next_outgoing_id: 0,
                incoming_window: WINDOW,
                outgoing_window: WINDOW,
                handle_max: u32::MAX,
                offered_capabilities: None,
                desired_capabilities: None,
                properties: None,
            }),
        )
        .await?;
        self.expect(|host_channel, p| match p {
            Performative::Begin(b) if b.remote_channel == Some(channel) => Some(host_channel),
            _ => None,
        })
        .await
    }

    /// Sends `attach` and waits for the host's attach of the same link.
    pub async fn attach(&self, channel: u16, attach: Attach) -> Result<Attach> {
        let name = attach.name.clone();
        self.send(channel, Performative::Attach(attach)).await?;
        self.expect(|_, p| match p {
            Performative::Attach(a) if a.name == name => Some(a.clone()),
            _ => None,
        })
        .await
    }

    /// Waits for the host's flow on `handle` and returns its link credit.
    pub async fn expect_credit(&self, handle: u32) -> Result<u32> {
        self.expect(|_, p| match p {
            Performative::Flow(f) if f.handle == Some(handle) => f.link_credit,
            _ => None,
        })
        .await
    }

    /// Grants `credit` on the client's receiving link `handle`.
    pub async fn flow(&self, channel: u16, handle: u32, delivery_count: u32, credit: u32) -> Result<()> {
        self.send(
            channel,
            Performative::Flow(Flow {
                next_incoming_id: Some(0),
                incoming_window: WINDOW,
                next_outgoing_id: self.transfers_sent.load(Ordering::Relaxed),
                outgoing_window: WINDOW,
                handle: Some(handle),
                delivery_count: Some(delivery_count),
                link_credit: Some(credit),
                ..Default::default()
            }),
        )
        .await
    }

    /// Sends `message` as one delivery, split into frames of at most
    /// [`CLIENT_MAX_FRAME_SIZE`] bytes.
    pub async fn transfer(
        &self,
        channel: u16,
        handle: u32,
        delivery_id: u32,
        message: &Message,
        settled: bool,
    ) -> Result<usize> {
        let transfer = Transfer {
            handle,
            delivery_id: Some(delivery_id),
            delivery_tag: Some(Bytes::copy_from_slice(&delivery_id.to_be_bytes())),
            message_format: Some(0),
            settled: Some(settled),
            ..Default::default()
        };
        let max_frame_size = CLIENT_MAX_FRAME_SIZE.min(self.remote_open.max_frame_size);
        let frames = encode_transfer(channel, &transfer, message.to_bytes(), max_frame_size);
        let count = frames.len();
        for frame in frames {
            self.send_raw(frame).await?;
        }
        self.transfers_sent.fetch_add(count as u32, Ordering::Relaxed);
        Ok(count)
    }

    /// Receives the next delivery on the host's link `handle`, joining
    /// continuation frames. Returns the first transfer and the message.
    pub async fn recv_message(&self, handle: u32) -> Result<(Transfer, Message)> {
        let mut first: Option<Transfer> = None;
        let mut payload = bytes::BytesMut::new();
        loop {
            let frame = self.recv().await?;
            let transfer = match frame.body {
                FrameBody::Amqp(Performative::Transfer(t)) if t.handle == handle => t,
                _ => continue,
            };
            payload.extend_from_slice(&frame.payload);
            let more = transfer.more;
            first.get_or_insert(transfer);
            if !more {
                break;
            }
        }
        let transfer = first.ok_or_else(|| anyhow!("no transfer on handle {}", handle))?;
        Ok((transfer, Message::decode(payload.freeze())?))
    }

    /// Closes the connection and waits for the host's close.
    pub async fn close(self) -> Result<()> {
        self.send(0, Performative::Close(Default::default())).await?;
        self.expect(|_, p| matches!(p, Performative::Close(_)).then_some(()))
            .await
            .context("waiting for close")?;
        let _ = self.transport.close().await;
        Ok(())
    }
}
