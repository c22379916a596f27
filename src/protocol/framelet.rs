//! Framelet wire format encoding.
//!
//! A frame is an ordered list of typed framelets:
//! ```text
//! ┌────────────────┬─────────────────────────────────────────┐
//! │ framelet_count │ framelet ... (count times)              │
//! │ 2 bytes, LE    │ tag: u16 LE │ length: u32 LE │ body     │
//! └────────────────┴─────────────────────────────────────────┘
//! ```
//! There is no overall frame length; the count governs termination.
//! All multi-byte integers are Little Endian.

use bytes::{BufMut, Bytes, BytesMut};

/// `EpoxyHeaders` framelet tag.
pub const FRAMELET_TAG_HEADERS: u16 = 0x454D;
/// `LayerData` framelet tag.
pub const FRAMELET_TAG_LAYER_DATA: u16 = 0x4C59;
/// `PayloadData` framelet tag.
pub const FRAMELET_TAG_PAYLOAD: u16 = 0x5044;
/// `EpoxyConfig` framelet tag.
pub const FRAMELET_TAG_CONFIG: u16 = 0x434F;
/// `ProtocolError` framelet tag.
pub const FRAMELET_TAG_PROTOCOL_ERROR: u16 = 0x4550;

/// Default per-framelet body cap (64 MiB).
///
/// Bounds the allocation a single length field can force; override via
/// [`ConnectionConfig`](crate::connection::ConnectionConfig).
pub const DEFAULT_MAX_FRAMELET_SIZE: u32 = 64 * 1024 * 1024;

/// Known framelet types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameletType {
    /// Per-message headers.
    EpoxyHeaders,
    /// Opaque layer-stack side data.
    LayerData,
    /// User payload or error record.
    PayloadData,
    /// Handshake signal.
    EpoxyConfig,
    /// Protocol error verdict.
    ProtocolError,
}

impl FrameletType {
    /// Wire tag for this type.
    #[inline]
    pub fn tag(self) -> u16 {
        match self {
            FrameletType::EpoxyHeaders => FRAMELET_TAG_HEADERS,
            FrameletType::LayerData => FRAMELET_TAG_LAYER_DATA,
            FrameletType::PayloadData => FRAMELET_TAG_PAYLOAD,
            FrameletType::EpoxyConfig => FRAMELET_TAG_CONFIG,
            FrameletType::ProtocolError => FRAMELET_TAG_PROTOCOL_ERROR,
        }
    }

    /// Map a wire tag back to a known type, if any.
    #[inline]
    pub fn from_tag(tag: u16) -> Option<Self> {
        match tag {
            FRAMELET_TAG_HEADERS => Some(FrameletType::EpoxyHeaders),
            FRAMELET_TAG_LAYER_DATA => Some(FrameletType::LayerData),
            FRAMELET_TAG_PAYLOAD => Some(FrameletType::PayloadData),
            FRAMELET_TAG_CONFIG => Some(FrameletType::EpoxyConfig),
            FRAMELET_TAG_PROTOCOL_ERROR => Some(FrameletType::ProtocolError),
            _ => None,
        }
    }
}

/// A typed, length-prefixed byte blob.
///
/// The raw tag is preserved even when it maps to no known type; rejecting
/// unknown tags is the classifier's job, so decode/encode round-trips
/// losslessly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Framelet {
    /// Raw wire tag.
    pub tag: u16,
    /// Opaque body bytes.
    pub body: Bytes,
}

impl Framelet {
    /// A framelet of a known type.
    pub fn new(kind: FrameletType, body: impl Into<Bytes>) -> Self {
        Self {
            tag: kind.tag(),
            body: body.into(),
        }
    }

    /// A framelet with a raw tag (test and interop use).
    pub fn raw(tag: u16, body: impl Into<Bytes>) -> Self {
        Self {
            tag,
            body: body.into(),
        }
    }

    /// The known type of this framelet, if the tag is recognized.
    #[inline]
    pub fn kind(&self) -> Option<FrameletType> {
        FrameletType::from_tag(self.tag)
    }
}

/// An ordered sequence of framelets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    /// Framelets in wire order.
    pub framelets: Vec<Framelet>,
}

impl Frame {
    /// An empty frame.
    pub fn new() -> Self {
        Self::default()
    }

    /// A frame holding a single framelet.
    pub fn single(framelet: Framelet) -> Self {
        Self {
            framelets: vec![framelet],
        }
    }

    /// Append a framelet, preserving order.
    pub fn push(&mut self, framelet: Framelet) {
        self.framelets.push(framelet);
    }

    /// Number of framelets.
    pub fn len(&self) -> usize {
        self.framelets.len()
    }

    /// True when the frame holds no framelets.
    pub fn is_empty(&self) -> bool {
        self.framelets.is_empty()
    }

    /// Total encoded size in bytes.
    pub fn encoded_len(&self) -> usize {
        2 + self
            .framelets
            .iter()
            .map(|f| 2 + 4 + f.body.len())
            .sum::<usize>()
    }
}

/// Encode a frame as a contiguous byte image.
///
/// The caller writes the result to the stream inside the write-lock
/// critical section, followed by a flush, so a frame always appears on the
/// wire as one contiguous byte sequence.
pub fn encode_frame(frame: &Frame) -> Bytes {
    debug_assert!(frame.framelets.len() <= u16::MAX as usize);

    let mut buf = BytesMut::with_capacity(frame.encoded_len());
    buf.put_u16_le(frame.framelets.len() as u16);
    for framelet in &frame.framelets {
        buf.put_u16_le(framelet.tag);
        buf.put_u32_le(framelet.body.len() as u32);
        buf.put_slice(&framelet.body);
    }
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_values() {
        assert_eq!(FrameletType::EpoxyHeaders.tag(), 0x454D);
        assert_eq!(FrameletType::LayerData.tag(), 0x4C59);
        assert_eq!(FrameletType::PayloadData.tag(), 0x5044);
        assert_eq!(FrameletType::EpoxyConfig.tag(), 0x434F);
        assert_eq!(FrameletType::ProtocolError.tag(), 0x4550);
    }

    #[test]
    fn test_tag_roundtrip() {
        for kind in [
            FrameletType::EpoxyHeaders,
            FrameletType::LayerData,
            FrameletType::PayloadData,
            FrameletType::EpoxyConfig,
            FrameletType::ProtocolError,
        ] {
            assert_eq!(FrameletType::from_tag(kind.tag()), Some(kind));
        }
        assert_eq!(FrameletType::from_tag(0xBEEF), None);
    }

    #[test]
    fn test_encode_little_endian_byte_order() {
        let frame = Frame::single(Framelet::raw(0x0102, Bytes::from_static(b"ab")));
        let bytes = encode_frame(&frame);

        // count = 1, LE
        assert_eq!(bytes[0], 0x01);
        assert_eq!(bytes[1], 0x00);
        // tag = 0x0102, LE
        assert_eq!(bytes[2], 0x02);
        assert_eq!(bytes[3], 0x01);
        // length = 2, LE
        assert_eq!(&bytes[4..8], &[0x02, 0x00, 0x00, 0x00]);
        // body
        assert_eq!(&bytes[8..], b"ab");
    }

    #[test]
    fn test_encode_preserves_order() {
        let mut frame = Frame::new();
        frame.push(Framelet::new(
            FrameletType::EpoxyHeaders,
            Bytes::from_static(b"h"),
        ));
        frame.push(Framelet::new(
            FrameletType::LayerData,
            Bytes::from_static(b"l"),
        ));
        frame.push(Framelet::new(
            FrameletType::PayloadData,
            Bytes::from_static(b"p"),
        ));

        let bytes = encode_frame(&frame);
        assert_eq!(bytes.len(), frame.encoded_len());
        assert_eq!(bytes[0], 3);

        // First framelet tag is EpoxyHeaders.
        assert_eq!(u16::from_le_bytes([bytes[2], bytes[3]]), 0x454D);
    }

    #[test]
    fn test_empty_frame_encoding() {
        let bytes = encode_frame(&Frame::new());
        assert_eq!(&bytes[..], &[0x00, 0x00]);
    }

    #[test]
    fn test_encoded_len() {
        let frame = Frame::single(Framelet::new(
            FrameletType::PayloadData,
            Bytes::from_static(b"hello"),
        ));
        assert_eq!(frame.encoded_len(), 2 + 2 + 4 + 5);
        assert_eq!(encode_frame(&frame).len(), frame.encoded_len());
    }
}
