//! Host-wide counters.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use serde::Serialize;

/// Snapshot of host metrics at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Connections accepted.
    pub connections_opened: u64,
    /// Connections terminated.
    pub connections_closed: u64,
    /// Connections currently running.
    pub active_connections: u32,
    /// Frames read, heartbeats included.
    pub frames_received: u64,
    /// Frames written, heartbeats included.
    pub frames_sent: u64,
    /// Bytes of frames read.
    pub bytes_received: u64,
    /// Bytes of frames written.
    pub bytes_sent: u64,
    /// Complete messages received.
    pub messages_received: u64,
    /// Messages sent.
    pub messages_sent: u64,
    /// Attaches answered successfully.
    pub attaches_accepted: u64,
    /// Attaches refused.
    pub attaches_rejected: u64,
    /// SASL exchanges that failed.
    pub sasl_failures: u64,
}

/// Thread-safe host metrics collector, shared by every listener of a host.
pub struct HostMetrics {
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    active_connections: AtomicU32,
    frames_received: AtomicU64,
    frames_sent: AtomicU64,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
    messages_received: AtomicU64,
    messages_sent: AtomicU64,
    attaches_accepted: AtomicU64,
    attaches_rejected: AtomicU64,
    sasl_failures: AtomicU64,
}

impl Default for HostMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HostMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostMetrics")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl HostMetrics {
    /// Creates a collector with all counters at zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            connections_opened: AtomicU64::new(0),
            connections_closed: AtomicU64::new(0),
            active_connections: AtomicU32::new(0),
            frames_received: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            attaches_accepted: AtomicU64::new(0),
            attaches_rejected: AtomicU64::new(0),
            sasl_failures: AtomicU64::new(0),
        }
    }

    pub(crate) fn connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)));
    }

    pub(crate) fn frame_received(&self, len: usize) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(len as u64, Ordering::Relaxed);
    }

    pub(crate) fn frame_sent(&self, len: usize) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(len as u64, Ordering::Relaxed);
    }

    pub(crate) fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn message_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn attach_accepted(&self) {
        self.attaches_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn attach_rejected(&self) {
        self.attaches_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn sasl_failed(&self) {
        self.sasl_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Takes a snapshot of all current values.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            attaches_accepted: self.attaches_accepted.load(Ordering::Relaxed),
            attaches_rejected: self.attaches_rejected.load(Ordering::Relaxed),
            sasl_failures: self.sasl_failures.load(Ordering::Relaxed),
        }
    }
}
