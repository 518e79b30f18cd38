//! Ordered, non-blocking writer in front of a transport.
//!
//! At most one send is in flight. Buffers written meanwhile are queued and
//! leave as one gather write once the current send completes.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::TransportError;
use crate::transport::Transport;

#[derive(Default)]
struct WriterState {
    queue: VecDeque<Bytes>,
    writing: bool,
    failed: bool,
}

type ErrorHook = Box<dyn Fn(TransportError) + Send + Sync>;

struct WriterInner {
    transport: Arc<dyn Transport>,
    state: Mutex<WriterState>,
    idle: Notify,
    on_error: ErrorHook,
}

/// Serializes writes onto a [`Transport`].
///
/// The first send failure is passed to the error hook, after which every
/// queued and future buffer is discarded.
#[derive(Clone)]
pub struct Writer {
    inner: Arc<WriterInner>,
}

impl std::fmt::Debug for Writer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Writer")
            .field("queued", &state.queue.len())
            .field("writing", &state.writing)
            .field("failed", &state.failed)
            .finish()
    }
}

impl Writer {
    /// Creates a writer that reports the first send failure to `on_error`.
    pub fn new<F>(transport: Arc<dyn Transport>, on_error: F) -> Self
    where
        F: Fn(TransportError) + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(WriterInner {
                transport,
                state: Mutex::new(WriterState::default()),
                idle: Notify::new(),
                on_error: Box::new(on_error),
            }),
        }
    }

    /// Queues `buf` for sending; starts a send immediately when idle.
    ///
    /// Must be called from within a tokio runtime.
    pub fn write(&self, buf: Bytes) {
        {
            let mut state = self.inner.state.lock();
            if state.failed {
                return;
            }
            if state.writing {
                state.queue.push_back(buf);
                return;
            }
            state.writing = true;
        }
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.drain(vec![buf]).await });
    }

    /// Waits until every buffer written so far has been sent or discarded.
    pub async fn flush(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.inner.state.lock().writing {
                return;
            }
            notified.await;
        }
    }

    /// Whether a send has failed.
    pub fn is_failed(&self) -> bool {
        self.inner.state.lock().failed
    }

    /// The transport this writer sends on.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }
}

impl WriterInner {
    async fn drain(&self, mut batch: Vec<Bytes>) {
        loop {
            let result = if batch.len() == 1 {
                let buf = batch.pop().unwrap_or_default();
                self.transport.send(buf).await
            } else {
                self.transport.send_vectored(std::mem::take(&mut batch)).await
            };

            if let Err(e) = result {
                {
                    let mut state = self.state.lock();
                    state.failed = true;
                    state.writing = false;
                    state.queue.clear();
                }
                tracing::debug!(peer = %self.transport.peer_addr(), error = %e, "write failed");
                (self.on_error)(e);
                self.idle.notify_waiters();
                return;
            }

            let mut state = self.state.lock();
            if state.queue.is_empty() {
                state.writing = false;
                drop(state);
                self.idle.notify_waiters();
                return;
            }
            batch = state.queue.drain(..).collect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use async_trait::async_trait;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingTransport {
        sent: parking_lot::Mutex<Vec<u8>>,
        calls: parking_lot::Mutex<Vec<usize>>,
        fail: bool,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send(&self, buf: Bytes) -> Result<()> {
            self.send_vectored(vec![buf]).await
        }

        async fn send_vectored(&self, bufs: Vec<Bytes>) -> Result<()> {
            tokio::time::sleep(Duration::from_millis(1)).await;
            if self.fail {
                return Err(TransportError::ConnectionReset);
            }
            self.calls.lock().push(bufs.len());
            let mut sent = self.sent.lock();
            for buf in bufs {
                sent.extend_from_slice(&buf);
            }
            Ok(())
        }

        async fn receive(&self, _buf: &mut [u8]) -> Result<usize> {
            Ok(0)
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }

        fn peer_addr(&self) -> &str {
            "memory"
        }

        fn local_addr(&self) -> &str {
            "memory"
        }
    }

    #[tokio::test]
    async fn test_queued_writes_are_batched_in_order() {
        let transport = Arc::new(RecordingTransport::default());
        let writer = Writer::new(transport.clone(), |_| {});
        for chunk in [&b"one "[..], b"two ", b"three ", b"four"] {
            writer.write(Bytes::copy_from_slice(chunk));
        }
        writer.flush().await;
        assert_eq!(&transport.sent.lock()[..], b"one two three four");
        assert_eq!(*transport.calls.lock(), vec![1, 3]);
        assert!(!writer.is_failed());
    }

    #[tokio::test]
    async fn test_failure_reported_once_and_writer_halts() {
        let transport = Arc::new(RecordingTransport {
            fail: true,
            ..Default::default()
        });
        let reports = Arc::new(AtomicUsize::new(0));
        let counter = reports.clone();
        let writer = Writer::new(transport, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        writer.write(Bytes::from_static(b"a"));
        writer.write(Bytes::from_static(b"b"));
        writer.flush().await;
        writer.write(Bytes::from_static(b"c"));
        writer.flush().await;
        assert!(writer.is_failed());
        assert_eq!(reports.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_flush_on_idle_writer_returns() {
        let writer = Writer::new(Arc::new(RecordingTransport::default()), |_| {});
        writer.flush().await;
    }

    proptest! {
        #[test]
        fn prop_writes_arrive_in_order(
            chunks in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 1..16), 1..40)
        ) {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .enable_all()
                .build()
                .unwrap();
            let sent = runtime.block_on(async {
                let transport = Arc::new(RecordingTransport::default());
                let writer = Writer::new(transport.clone(), |_| {});
                let mut expected = Vec::new();
                for chunk in &chunks {
                    writer.write(Bytes::copy_from_slice(chunk));
                    expected.extend_from_slice(chunk);
                    if chunk[0] % 5 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
                writer.flush().await;
                let sent = transport.sent.lock().clone();
                (sent, expected)
            });
            prop_assert_eq!(sent.0, sent.1);
        }
    }
}
