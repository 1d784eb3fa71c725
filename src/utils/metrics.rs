//! Observability and Metrics
//!
//! Atomic counters describing connection and call activity. A server or a
//! channel owns one `Arc<Metrics>`; [`Metrics::snapshot`] reads them all.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

use crate::protocol::status::Code;

#[derive(Debug)]
pub struct Metrics {
    /// Total connections established
    pub connections_total: AtomicU64,
    /// Currently active connections
    pub connections_active: AtomicU64,
    /// Failed TLS handshakes (including rejected client certificates)
    pub handshakes_failed: AtomicU64,
    /// Calls started
    pub calls_started: AtomicU64,
    /// Calls finished with OK
    pub calls_succeeded: AtomicU64,
    /// Calls finished with any other status
    pub calls_failed: AtomicU64,
    /// Calls rejected with UNAUTHENTICATED
    pub calls_rejected: AtomicU64,
    /// Calls finished with CANCELLED or DEADLINE_EXCEEDED
    pub calls_cancelled: AtomicU64,
    /// Total messages sent
    pub messages_sent: AtomicU64,
    /// Total messages received
    pub messages_received: AtomicU64,
    /// Total payload bytes sent
    pub bytes_sent: AtomicU64,
    /// Total payload bytes received
    pub bytes_received: AtomicU64,
    /// Malformed or out-of-order frames
    pub protocol_errors: AtomicU64,
    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            handshakes_failed: AtomicU64::new(0),
            calls_started: AtomicU64::new(0),
            calls_succeeded: AtomicU64::new(0),
            calls_failed: AtomicU64::new(0),
            calls_rejected: AtomicU64::new(0),
            calls_cancelled: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn connection_established(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn handshake_failed(&self) {
        self.handshakes_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn call_started(&self) {
        self.calls_started.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the terminal status of a call
    pub fn call_finished(&self, code: Code) {
        match code {
            Code::Ok => self.calls_succeeded.fetch_add(1, Ordering::Relaxed),
            Code::Unauthenticated => {
                self.calls_rejected.fetch_add(1, Ordering::Relaxed);
                self.calls_failed.fetch_add(1, Ordering::Relaxed)
            }
            Code::Cancelled | Code::DeadlineExceeded => {
                self.calls_cancelled.fetch_add(1, Ordering::Relaxed);
                self.calls_failed.fetch_add(1, Ordering::Relaxed)
            }
            _ => self.calls_failed.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn message_sent(&self, byte_count: u64) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn message_received(&self, byte_count: u64) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            handshakes_failed: self.handshakes_failed.load(Ordering::Relaxed),
            calls_started: self.calls_started.load(Ordering::Relaxed),
            calls_succeeded: self.calls_succeeded.load(Ordering::Relaxed),
            calls_failed: self.calls_failed.load(Ordering::Relaxed),
            calls_rejected: self.calls_rejected.load(Ordering::Relaxed),
            calls_cancelled: self.calls_cancelled.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            connections_total = snapshot.connections_total,
            connections_active = snapshot.connections_active,
            handshakes_failed = snapshot.handshakes_failed,
            calls_started = snapshot.calls_started,
            calls_succeeded = snapshot.calls_succeeded,
            calls_failed = snapshot.calls_failed,
            calls_rejected = snapshot.calls_rejected,
            calls_cancelled = snapshot.calls_cancelled,
            messages_sent = snapshot.messages_sent,
            messages_received = snapshot.messages_received,
            protocol_errors = snapshot.protocol_errors,
            uptime_seconds = snapshot.uptime_seconds,
            "RPC metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub handshakes_failed: u64,
    pub calls_started: u64,
    pub calls_succeeded: u64,
    pub calls_failed: u64,
    pub calls_rejected: u64,
    pub calls_cancelled: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub protocol_errors: u64,
    pub uptime_seconds: u64,
}
