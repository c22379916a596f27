//! Frame classification.
//!
//! [`classify`] is a pure function from a decoded frame to a
//! [`Disposition`]: what the engine should do with it, plus the extracted
//! header/layer-data/payload slices. It performs no I/O and mutates no
//! state; the engine owns every transition it implies.

use bytes::Bytes;

use super::framelet::{Frame, FrameletType};
use crate::codec::MsgPackCodec;
use crate::message::{EpoxyHeaders, PayloadType, ProtocolError, ProtocolErrorCode};

/// Extracted parts of a request/response/event frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    /// Decoded message headers.
    pub headers: EpoxyHeaders,
    /// Opaque layer-stack blob, when present.
    pub layer_data: Option<Bytes>,
    /// Opaque payload bytes.
    pub payload: Bytes,
}

/// The classifier's verdict on a decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// The frame is a handshake config signal.
    ProcessConfig,
    /// Deliver a request to the service host.
    DeliverRequest(Inbound),
    /// Complete an outstanding conversation.
    DeliverResponse(Inbound),
    /// Deliver a fire-and-forget event.
    DeliverEvent(Inbound),
    /// The frame is invalid; report the code to the peer and hang up.
    SendProtocolError(ProtocolErrorCode),
    /// The peer reported a protocol error; hang up without replying.
    HandleProtocolError(ProtocolError),
    /// Hang up without replying.
    HangUp,
}

/// Classify a decoded frame.
///
/// Accepted shapes:
/// - `[EpoxyConfig]`
/// - `[ProtocolError]`
/// - `[EpoxyHeaders, PayloadData]`
/// - `[EpoxyHeaders, LayerData, PayloadData]`
///
/// Everything else is malformed. A received `ProtocolError` is never
/// replied to: an unparseable or unknown one maps to [`Disposition::HangUp`]
/// rather than `SendProtocolError`.
pub fn classify(frame: &Frame) -> Disposition {
    if frame.is_empty() {
        return Disposition::SendProtocolError(ProtocolErrorCode::MalformedData);
    }

    // Reject unknown tags and duplicate framelet types up front; the shape
    // checks below can then assume each type appears at most once.
    let mut seen: Vec<FrameletType> = Vec::with_capacity(frame.len());
    for framelet in &frame.framelets {
        match framelet.kind() {
            None => return Disposition::SendProtocolError(ProtocolErrorCode::MalformedData),
            Some(kind) => {
                if seen.contains(&kind) {
                    return Disposition::SendProtocolError(ProtocolErrorCode::MalformedData);
                }
                seen.push(kind);
            }
        }
    }

    match seen[0] {
        FrameletType::EpoxyConfig => {
            if frame.len() != 1 {
                return Disposition::SendProtocolError(ProtocolErrorCode::MalformedData);
            }
            Disposition::ProcessConfig
        }
        FrameletType::ProtocolError => {
            if frame.len() != 1 {
                return Disposition::SendProtocolError(ProtocolErrorCode::MalformedData);
            }
            match MsgPackCodec::decode::<ProtocolError>(&frame.framelets[0].body) {
                Ok(error) => Disposition::HandleProtocolError(error),
                Err(_) => Disposition::HangUp,
            }
        }
        FrameletType::EpoxyHeaders => classify_message(frame, &seen),
        _ => Disposition::SendProtocolError(ProtocolErrorCode::MalformedData),
    }
}

fn classify_message(frame: &Frame, seen: &[FrameletType]) -> Disposition {
    let expected: &[FrameletType] = match seen.len() {
        2 => &[FrameletType::EpoxyHeaders, FrameletType::PayloadData],
        3 => &[
            FrameletType::EpoxyHeaders,
            FrameletType::LayerData,
            FrameletType::PayloadData,
        ],
        _ => return Disposition::SendProtocolError(ProtocolErrorCode::MalformedData),
    };
    if seen != expected {
        return Disposition::SendProtocolError(ProtocolErrorCode::MalformedData);
    }

    let headers: EpoxyHeaders = match MsgPackCodec::decode(&frame.framelets[0].body) {
        Ok(headers) => headers,
        Err(_) => return Disposition::SendProtocolError(ProtocolErrorCode::MalformedData),
    };

    let (layer_data, payload) = if seen.len() == 3 {
        (
            Some(frame.framelets[1].body.clone()),
            frame.framelets[2].body.clone(),
        )
    } else {
        (None, frame.framelets[1].body.clone())
    };

    let inbound = Inbound {
        headers,
        layer_data,
        payload,
    };

    match inbound.headers.payload_type {
        PayloadType::Request => Disposition::DeliverRequest(inbound),
        PayloadType::Response => Disposition::DeliverResponse(inbound),
        PayloadType::Event => Disposition::DeliverEvent(inbound),
    }
}
