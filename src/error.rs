//! Error types for epoxy-core.

use thiserror::Error;

use crate::connection::ConnectionState;
use crate::message::ProtocolError;

/// Main error type for all epoxy operations.
#[derive(Debug, Error)]
pub enum EpoxyError {
    /// I/O error on the underlying stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Local protocol violation (malformed frame, bad framelet composition).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The peer reported a protocol error, or rejected the connection
    /// during the handshake.
    #[error("Peer protocol error: {0:?}")]
    PeerProtocolError(ProtocolError),

    /// Operation attempted in a state that does not allow it.
    #[error("Connection is {actual:?}, operation requires {required:?}")]
    InvalidState {
        /// State the operation requires.
        required: ConnectionState,
        /// State the connection was observed in.
        actual: ConnectionState,
    },

    /// The connection closed before the operation could complete.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The caller cancelled the operation.
    #[error("Operation cancelled")]
    Cancelled,
}

/// Result type alias using EpoxyError.
pub type Result<T> = std::result::Result<T, EpoxyError>;
