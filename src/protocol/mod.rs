//! Protocol module - framelet wire format, frame I/O, and classification.
//!
//! This module implements the binary framing for the connection core:
//! - framelet type tags and little-endian frame encoding
//! - cancellable async frame reading with clean-EOF detection
//! - pure classification of decoded frames into dispositions

mod classify;
mod framelet;
mod framing;

pub use classify::{classify, Disposition, Inbound};
pub use framelet::{
    encode_frame, Frame, Framelet, FrameletType, DEFAULT_MAX_FRAMELET_SIZE, FRAMELET_TAG_CONFIG,
    FRAMELET_TAG_HEADERS, FRAMELET_TAG_LAYER_DATA, FRAMELET_TAG_PAYLOAD,
    FRAMELET_TAG_PROTOCOL_ERROR,
};
pub use framing::{read_frame, FramingError};
