//! Per-peer traffic counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of a peer's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerStats {
    /// PDUs handed to the endpoint successfully
    pub pdus_sent: u64,
    /// PDUs decoded from the endpoint
    pub pdus_received: u64,
    /// Encoded bytes of sent PDUs
    pub bytes_sent: u64,
    /// Encoded bytes of received PDUs
    pub bytes_received: u64,
    /// PDUs reported back as `SendError`
    pub send_errors: u64,
    /// Connections established
    pub connects: u64,
    /// Connections lost
    pub disconnects: u64,
}

#[derive(Debug, Default)]
pub(crate) struct PeerCounters {
    pdus_sent: AtomicU64,
    pdus_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    send_errors: AtomicU64,
    connects: AtomicU64,
    disconnects: AtomicU64,
}

impl PeerCounters {
    pub(crate) fn record_sent(&self, bytes: usize) {
        self.pdus_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_received(&self, bytes: usize) {
        self.pdus_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_send_error(&self) {
        self.send_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_connect(&self) {
        self.connects.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> PeerStats {
        PeerStats {
            pdus_sent: self.pdus_sent.load(Ordering::Relaxed),
            pdus_received: self.pdus_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            connects: self.connects.load(Ordering::Relaxed),
            disconnects: self.disconnects.load(Ordering::Relaxed),
        }
    }
}
