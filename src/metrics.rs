//! Per-connection metrics emitted once at teardown.

/// Terminal cause of a connection, recorded in [`ConnectionMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionShutdownReason {
    /// No terminal cause was recorded.
    #[default]
    Unknown,
    /// The client stopped the connection deliberately.
    ClientGraceful,
    /// The server stopped the connection deliberately.
    ServerGraceful,
    /// A protocol violation tore the connection down.
    ClientProtocolError,
    /// The engine itself failed.
    EpoxyInternalError,
    /// A service dispatch failed terminally.
    ServiceInternalError,
    /// The underlying stream failed or closed unexpectedly.
    NetworkError,
}

/// Lifecycle record for a single connection.
///
/// Created at connection construction and emitted exactly once, after the
/// connection reaches its terminal state.
#[derive(Debug, Clone)]
pub struct ConnectionMetrics {
    /// Unique id for this connection, for log correlation.
    pub connection_id: String,
    /// Local endpoint label, e.g. `127.0.0.1:52110`.
    pub local_endpoint: String,
    /// Remote endpoint label.
    pub remote_endpoint: String,
    /// Why the connection ended.
    pub shutdown_reason: ConnectionShutdownReason,
    /// Wall-clock lifetime, stamped at teardown.
    pub duration_millis: u64,
}

impl ConnectionMetrics {
    /// Fresh metrics for a connection between the given endpoints.
    pub fn new(local_endpoint: String, remote_endpoint: String) -> Self {
        Self {
            connection_id: generate_connection_id(),
            local_endpoint,
            remote_endpoint,
            shutdown_reason: ConnectionShutdownReason::Unknown,
            duration_millis: 0,
        }
    }
}

/// Generate a process-unique connection id.
///
/// Mixes the clock with the process id; uniqueness only needs to hold for
/// log correlation, not across hosts.
fn generate_connection_id() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};

    static SEQUENCE: AtomicU64 = AtomicU64::new(0);

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let pid = std::process::id() as u64;
    let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!(
        "{:016x}",
        nanos.wrapping_mul(0x517cc1b727220a95) ^ pid ^ (seq << 48)
    )
}

/// Receives the [`ConnectionMetrics`] record at teardown.
pub trait MetricsSink: Send + Sync + 'static {
    /// Called exactly once per connection, after it disconnects.
    fn emit(&self, metrics: &ConnectionMetrics);
}

/// Default sink: logs the record through `tracing`.
#[derive(Debug, Default)]
pub struct LogMetricsSink;

impl MetricsSink for LogMetricsSink {
    fn emit(&self, metrics: &ConnectionMetrics) {
        tracing::info!(
            connection_id = %metrics.connection_id,
            local = %metrics.local_endpoint,
            remote = %metrics.remote_endpoint,
            reason = ?metrics.shutdown_reason,
            duration_millis = metrics.duration_millis,
            "connection closed"
        );
    }
}
