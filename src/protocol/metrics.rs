use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Track xrpc call metrics without external dependencies.
pub(crate) struct Metrics;

static CALLS_SENT: AtomicU64 = AtomicU64::new(0);
static REPLIES_RECEIVED: AtomicU64 = AtomicU64::new(0);
static REQUESTS_SERVED: AtomicU64 = AtomicU64::new(0);
static CALL_ERRORS: AtomicU64 = AtomicU64::new(0);
static SERVE_ERRORS: AtomicU64 = AtomicU64::new(0);
static CLIENT_CONNECTIONS: AtomicU64 = AtomicU64::new(0);
static SERVER_CONNECTIONS: AtomicU64 = AtomicU64::new(0);
static HANDLER_LATENCY_TOTAL_NS: AtomicU64 = AtomicU64::new(0);
static HANDLER_LATENCY_MAX_NS: AtomicU64 = AtomicU64::new(0);

const NANOSECONDS_PER_MICROSECOND: u128 = 1_000;

/// Which end of a connection is counted.
#[derive(Clone, Copy)]
pub(crate) enum Side {
    Client,
    Server,
}

impl Side {
    fn connections(self) -> &'static AtomicU64 {
        match self {
            Self::Client => &CLIENT_CONNECTIONS,
            Self::Server => &SERVER_CONNECTIONS,
        }
    }
}

impl Metrics {
    #[inline]
    pub(crate) fn record_call_sent() {
        CALLS_SENT.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_reply_received() {
        REPLIES_RECEIVED.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_call_error() {
        CALL_ERRORS.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_served(elapsed: Duration, failed: bool) {
        REQUESTS_SERVED.fetch_add(1, Ordering::Relaxed);
        if failed {
            SERVE_ERRORS.fetch_add(1, Ordering::Relaxed);
        }

        let nanos = elapsed
            .as_nanos()
            .min(u128::from(u64::MAX))
            .try_into()
            .unwrap_or(u64::MAX);
        HANDLER_LATENCY_TOTAL_NS.fetch_add(nanos, Ordering::Relaxed);
        update_max(&HANDLER_LATENCY_MAX_NS, nanos);
    }

    #[inline]
    pub(crate) fn record_connection_open(side: Side) {
        side.connections().fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_connection_close(side: Side) {
        side.connections().fetch_sub(1, Ordering::Relaxed);
    }
}

fn update_max(target: &AtomicU64, candidate: u64) {
    let mut current = target.load(Ordering::Relaxed);
    while candidate > current {
        match target.compare_exchange_weak(
            current,
            candidate,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => return,
            Err(old) => current = old,
        }
    }
}

/// Read the process-wide counters.
#[must_use]
pub fn snapshot() -> MetricsSnapshot {
    MetricsSnapshot {
        calls_sent: CALLS_SENT.load(Ordering::Relaxed),
        replies_received: REPLIES_RECEIVED.load(Ordering::Relaxed),
        requests_served: REQUESTS_SERVED.load(Ordering::Relaxed),
        call_errors: CALL_ERRORS.load(Ordering::Relaxed),
        serve_errors: SERVE_ERRORS.load(Ordering::Relaxed),
        client_connections: CLIENT_CONNECTIONS.load(Ordering::Relaxed),
        server_connections: SERVER_CONNECTIONS.load(Ordering::Relaxed),
        handler_latency_total_ns: HANDLER_LATENCY_TOTAL_NS.load(Ordering::Relaxed),
        handler_latency_max_ns: HANDLER_LATENCY_MAX_NS.load(Ordering::Relaxed),
    }
}

/// Lightweight snapshot of call counters.
#[derive(Default, Debug, Clone, Copy)]
#[allow(missing_docs)]
pub struct MetricsSnapshot {
    pub calls_sent: u64,
    pub replies_received: u64,
    pub requests_served: u64,
    pub call_errors: u64,
    pub serve_errors: u64,
    pub client_connections: u64,
    pub server_connections: u64,
    pub handler_latency_total_ns: u64,
    pub handler_latency_max_ns: u64,
}

impl MetricsSnapshot {
    /// Average handler latency in microseconds.
    #[must_use]
    pub fn avg_handler_latency_us(&self) -> Option<u64> {
        if self.requests_served == 0 {
            return None;
        }

        let total_ns = u128::from(self.handler_latency_total_ns);
        Some((total_ns / (u128::from(self.requests_served) * NANOSECONDS_PER_MICROSECOND)) as u64)
    }
}
