use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide counters for the relay.
///
/// Only aggregates are kept; nothing is recorded per connection.
#[derive(Debug, Default)]
pub struct RelayMetrics {
    connections: AtomicU64,
    info_requests: AtomicU64,
    rejected_requests: AtomicU64,
    splices: AtomicU64,
    failed_dials: AtomicU64,
    bytes_to_backend: AtomicU64,
    bytes_to_client: AtomicU64,
}

/// Point-in-time copy of [`RelayMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connections: u64,
    pub info_requests: u64,
    pub rejected_requests: u64,
    pub splices: u64,
    pub failed_dials: u64,
    pub bytes_to_backend: u64,
    pub bytes_to_client: u64,
}

impl RelayMetrics {
    pub(crate) fn connection_accepted(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn info_request(&self) {
        self.info_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn request_rejected(&self) {
        self.rejected_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn splice_started(&self) {
        self.splices.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dial_failed(&self) {
        self.failed_dials.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_bytes_to_backend(&self, n: u64) {
        self.bytes_to_backend.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_bytes_to_client(&self, n: u64) {
        self.bytes_to_client.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections: self.connections.load(Ordering::Relaxed),
            info_requests: self.info_requests.load(Ordering::Relaxed),
            rejected_requests: self.rejected_requests.load(Ordering::Relaxed),
            splices: self.splices.load(Ordering::Relaxed),
            failed_dials: self.failed_dials.load(Ordering::Relaxed),
            bytes_to_backend: self.bytes_to_backend.load(Ordering::Relaxed),
            bytes_to_client: self.bytes_to_client.load(Ordering::Relaxed),
        }
    }
}
