//! Byte-level transport abstraction shared by TCP, TLS and WebSocket.
//!
//! A transport is used by two tasks at once: the frame pump receives while the
//! writer sends, so every method takes `&self`.

use std::io::IoSlice;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;

use crate::error::Result;

/// A bidirectional byte stream carrying AMQP frames.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Sends one buffer completely.
    async fn send(&self, buf: Bytes) -> Result<()>;

    /// Sends several buffers as one gather write, preserving their order.
    async fn send_vectored(&self, bufs: Vec<Bytes>) -> Result<()> {
        let total = bufs.iter().map(Bytes::len).sum();
        let mut joined = BytesMut::with_capacity(total);
        for buf in &bufs {
            joined.extend_from_slice(buf);
        }
        self.send(joined.freeze()).await
    }

    /// Receives up to `buf.len()` bytes, returning how many were read.
    /// Zero means the peer closed the stream.
    async fn receive(&self, buf: &mut [u8]) -> Result<usize>;

    /// Closes the transport. Calling it more than once has no further effect.
    async fn close(&self) -> Result<()>;

    /// Remote peer address.
    fn peer_addr(&self) -> &str;

    /// Local address.
    fn local_addr(&self) -> &str;

    /// DER certificates presented by the peer during a TLS handshake.
    fn peer_certificates(&self) -> Option<Vec<Vec<u8>>> {
        None
    }
}

/// One-shot close flag that also wakes pending reads.
#[derive(Debug, Default)]
pub(crate) struct CloseSignal {
    closed: AtomicBool,
    notify: Notify,
}

impl CloseSignal {
    /// Marks the transport closed; returns true only for the first caller.
    pub(crate) fn close(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::SeqCst);
        if first {
            self.notify.notify_waiters();
        }
        first
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolves once [`CloseSignal::close`] has been called.
    pub(crate) async fn closed(&self) {
        let notified = self.notify.notified();
        if self.is_closed() {
            return;
        }
        notified.await;
    }
}

/// Writes every buffer using vectored writes, advancing across partial writes.
pub(crate) async fn write_all_vectored<W>(writer: &mut W, mut bufs: Vec<Bytes>) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut index = 0;
    while index < bufs.len() {
        let written = {
            let slices: Vec<IoSlice<'_>> = bufs[index..].iter().map(|b| IoSlice::new(b)).collect();
            writer.write_vectored(&slices).await?
        };
        if written == 0 && bufs[index..].iter().any(|b| !b.is_empty()) {
            return Err(std::io::ErrorKind::WriteZero.into());
        }
        let mut remaining = written;
        while index < bufs.len() && remaining >= bufs[index].len() {
            remaining -= bufs[index].len();
            index += 1;
        }
        if remaining > 0 {
            bufs[index].advance(remaining);
        }
    }
    writer.flush().await
}
