//! Wire records and the payload-or-error message type.
//!
//! These are the structured bodies carried inside framelets: the per-message
//! `EpoxyHeaders`, the empty `EpoxyConfig` handshake record, `ProtocolError`
//! verdicts, and the polymorphic `Error` record used for user-domain and
//! transport failures. All of them serialize as MsgPack named maps via
//! [`MsgPackCodec`](crate::codec::MsgPackCodec).

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Well-known `error_code` values for [`Error`] records.
///
/// `0` is OK; everything else marks the payload as an error record.
pub mod status {
    /// No error.
    pub const OK: i32 = 0;
    /// No handler is registered for the requested method.
    pub const METHOD_NOT_FOUND: i32 = 1;
    /// The service failed while producing a response.
    pub const INTERNAL_SERVER_ERROR: i32 = 2;
    /// The connection failed before a response was received.
    pub const TRANSPORT_ERROR: i32 = 3;
    /// The connection was shut down while the operation was in flight.
    pub const CONNECTION_SHUT_DOWN: i32 = 4;
}

/// Kind of payload a frame carries, recorded in [`EpoxyHeaders`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayloadType {
    /// Expects a correlated response.
    Request,
    /// Completes an outstanding request.
    Response,
    /// Fire-and-forget, no response.
    Event,
}

/// Per-message headers, carried in the `EpoxyHeaders` framelet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpoxyHeaders {
    /// Conversation this message belongs to.
    pub conversation_id: u64,
    /// Request, Response, or Event.
    pub payload_type: PayloadType,
    /// Target method; empty for responses.
    pub method_name: String,
    /// `status::OK` for user payloads; any other value means the payload
    /// is an [`Error`] record.
    pub error_code: i32,
}

impl EpoxyHeaders {
    /// Headers for a request frame.
    pub fn request(conversation_id: u64, method_name: &str) -> Self {
        Self {
            conversation_id,
            payload_type: PayloadType::Request,
            method_name: method_name.to_string(),
            error_code: status::OK,
        }
    }

    /// Headers for a response frame; `method_name` stays empty.
    pub fn response(conversation_id: u64, error_code: i32) -> Self {
        Self {
            conversation_id,
            payload_type: PayloadType::Response,
            method_name: String::new(),
            error_code,
        }
    }

    /// Headers for an event frame.
    pub fn event(conversation_id: u64, method_name: &str) -> Self {
        Self {
            conversation_id,
            payload_type: PayloadType::Event,
            method_name: method_name.to_string(),
            error_code: status::OK,
        }
    }
}

/// Handshake record. Empty today; its presence on the wire is the whole
/// signal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpoxyConfig {}

/// Protocol-level error verdicts. Wire values are fixed and must match
/// peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
#[repr(i32)]
pub enum ProtocolErrorCode {
    /// Not an error.
    Ok = 0,
    /// The reporting side failed internally.
    InternalError = 1,
    /// The server refused the connection during the handshake.
    ConnectionRejected = 2,
    /// The peer violated the protocol state machine.
    ProtocolViolated = 3,
    /// A response referenced a conversation the peer never started.
    ConversationIdUnknown = 4,
    /// A frame failed structural validation.
    MalformedData = 5,
}

impl From<ProtocolErrorCode> for i32 {
    fn from(code: ProtocolErrorCode) -> i32 {
        code as i32
    }
}

impl TryFrom<i32> for ProtocolErrorCode {
    type Error = String;

    fn try_from(value: i32) -> std::result::Result<Self, String> {
        match value {
            0 => Ok(ProtocolErrorCode::Ok),
            1 => Ok(ProtocolErrorCode::InternalError),
            2 => Ok(ProtocolErrorCode::ConnectionRejected),
            3 => Ok(ProtocolErrorCode::ProtocolViolated),
            4 => Ok(ProtocolErrorCode::ConversationIdUnknown),
            5 => Ok(ProtocolErrorCode::MalformedData),
            other => Err(format!("unknown protocol error code {other}")),
        }
    }
}

/// Body of a `ProtocolError` framelet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolError {
    /// What went wrong, from the reporter's point of view.
    pub error_code: ProtocolErrorCode,
    /// Optional details, e.g. the rejection reason from a connection
    /// observer.
    pub details: Option<Error>,
}

impl ProtocolError {
    /// A protocol error with no details attached.
    pub fn new(error_code: ProtocolErrorCode) -> Self {
        Self {
            error_code,
            details: None,
        }
    }
}

/// Polymorphic error record.
///
/// The core never interprets user-domain errors; it only constructs
/// transport-shaped and internal-server-shaped records at well-defined
/// points. Nested causes chain through `inner`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Error {
    /// One of [`status`], or a user-domain code.
    pub error_code: i32,
    /// Human-readable description.
    pub message: String,
    /// Optional cause.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inner: Option<Box<Error>>,
}

impl Error {
    /// An error with the given code and message, no cause.
    pub fn new(error_code: i32, message: impl Into<String>) -> Self {
        Self {
            error_code,
            message: message.into(),
            inner: None,
        }
    }

    /// The synthetic error used to fail awaiters when the connection dies.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(status::TRANSPORT_ERROR, message)
    }

    /// The error sent in place of a response when dispatch fails.
    pub fn internal_server_error(message: impl Into<String>) -> Self {
        Self::new(status::INTERNAL_SERVER_ERROR, message)
    }

    /// Attach a cause.
    pub fn with_inner(mut self, inner: Error) -> Self {
        self.inner = Some(Box::new(inner));
        self
    }

    /// Fold multiple errors into one record chained through `inner`.
    ///
    /// Returns `None` for an empty list.
    pub fn aggregate(
        message: impl Into<String>,
        errors: impl IntoIterator<Item = Error>,
    ) -> Option<Self> {
        let mut iter = errors.into_iter();
        let first = iter.next()?;
        let chained = iter.fold(first, |acc, next| next.with_inner(acc));
        Some(Self::new(chained.error_code, message).with_inner(chained))
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "error {}: {}", self.error_code, self.message)?;
        if let Some(inner) = &self.inner {
            write!(f, " (caused by: {inner})")?;
        }
        Ok(())
    }
}

/// A delivered message: either an opaque user payload or an [`Error`]
/// record.
///
/// Responses routinely carry either variant; the header `error_code`
/// decides which on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Opaque user payload bytes.
    Payload(Bytes),
    /// A structured error record.
    Error(Error),
}

impl Message {
    /// Wrap already-serialized payload bytes.
    pub fn payload(bytes: impl Into<Bytes>) -> Self {
        Message::Payload(bytes.into())
    }

    /// Wrap an error record.
    pub fn error(error: Error) -> Self {
        Message::Error(error)
    }

    /// True when this message carries an error record.
    #[inline]
    pub fn is_error(&self) -> bool {
        matches!(self, Message::Error(_))
    }

    /// The header `error_code` this message should travel with.
    #[inline]
    pub fn error_code(&self) -> i32 {
        match self {
            Message::Payload(_) => status::OK,
            Message::Error(e) => e.error_code,
        }
    }
}
