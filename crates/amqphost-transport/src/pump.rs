//! Frame pump: reads protocol headers and length-prefixed frames off a
//! transport and hands them to a handler.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};

use crate::error::{Result, TransportError};
use crate::transport::Transport;

/// Size of a protocol header and of a frame header.
pub const HEADER_SIZE: usize = 8;

/// Reads whole frames from a transport.
///
/// The frame size limit is shared so it can be raised once the peer's open
/// has been processed.
#[derive(Clone)]
pub struct FrameReader {
    transport: Arc<dyn Transport>,
    max_frame_size: Arc<AtomicU32>,
}

impl std::fmt::Debug for FrameReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameReader")
            .field("peer", &self.transport.peer_addr())
            .field("max_frame_size", &self.max_frame_size.load(Ordering::Relaxed))
            .finish()
    }
}

impl FrameReader {
    /// Creates a reader enforcing `max_frame_size`.
    pub fn new(transport: Arc<dyn Transport>, max_frame_size: Arc<AtomicU32>) -> Self {
        Self {
            transport,
            max_frame_size,
        }
    }

    /// The transport being read.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Reads an 8-byte protocol header.
    pub async fn read_header(&self) -> Result<[u8; HEADER_SIZE]> {
        let mut header = [0u8; HEADER_SIZE];
        self.read_exact(&mut header).await?;
        Ok(header)
    }

    /// Reads one complete frame, size field included.
    pub async fn read_frame(&self) -> Result<Bytes> {
        let mut size_buf = [0u8; 4];
        self.read_exact(&mut size_buf).await?;
        let size = u32::from_be_bytes(size_buf);
        let max_size = self.max_frame_size.load(Ordering::Acquire);
        if (size as usize) < HEADER_SIZE {
            return Err(TransportError::InvalidFrame {
                reason: format!("frame size {} is smaller than the frame header", size),
            });
        }
        if size > max_size {
            return Err(TransportError::FrameTooLarge {
                size,
                max_size,
            });
        }

        let mut frame = BytesMut::zeroed(size as usize);
        frame[..4].copy_from_slice(&size_buf);
        self.read_exact(&mut frame[4..]).await?;
        Ok(frame.freeze())
    }

    async fn read_exact(&self, buf: &mut [u8]) -> Result<()> {
        let mut offset = 0;
        while offset < buf.len() {
            let n = self.transport.receive(&mut buf[offset..]).await?;
            if n == 0 {
                return Err(TransportError::ConnectionReset);
            }
            offset += n;
        }
        Ok(())
    }
}

/// Receives what the pump reads. Returning false stops the pump.
#[async_trait]
pub trait FrameHandler: Send {
    /// Called with the protocol header when the pump was asked to read one.
    async fn on_header(&mut self, header: [u8; HEADER_SIZE]) -> bool;

    /// Called with every complete frame.
    async fn on_frame(&mut self, frame: Bytes) -> bool;
}

/// Reads until the handler stops it or the transport fails.
///
/// With `read_header` set the first 8 bytes are delivered as a protocol
/// header before any frame.
pub async fn pump<H>(reader: FrameReader, handler: &mut H, read_header: bool) -> Result<()>
where
    H: FrameHandler + ?Sized,
{
    if read_header {
        let header = reader.read_header().await?;
        if !handler.on_header(header).await {
            return Ok(());
        }
    }
    loop {
        let frame = reader.read_frame().await?;
        if !handler.on_frame(frame).await {
            return Ok(());
        }
    }
}
