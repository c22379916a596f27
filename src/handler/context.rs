//! Per-message context records.

use crate::metrics::ConnectionMetrics;

/// Context handed to the service host with each inbound request or event.
#[derive(Debug, Clone)]
pub struct ReceiveContext {
    /// Conversation the message belongs to.
    pub conversation_id: u64,
    /// Snapshot of the connection's identity (id, endpoints). The shutdown
    /// fields are only meaningful after teardown.
    pub metrics: ConnectionMetrics,
}

impl ReceiveContext {
    /// The connection id, for log correlation.
    #[inline]
    pub fn connection_id(&self) -> &str {
        &self.metrics.connection_id
    }
}

/// Context handed to the layer stack for each outbound message.
#[derive(Debug, Clone)]
pub struct SendContext {
    /// Conversation the message belongs to.
    pub conversation_id: u64,
    /// The sending connection's id.
    pub connection_id: String,
}
