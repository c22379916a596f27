//! Async frame reading.
//!
//! [`read_frame`] pulls one frame off the stream: the framelet count, then
//! each framelet's tag, length, and body. Three outcomes matter to the
//! engine and are kept distinct:
//!
//! - clean EOF before any byte of a frame → `Ok(None)`, peer hang-up
//! - cancellation mid-read → [`FramingError::Disconnecting`], not an error
//!   carrying I/O detail
//! - a short read after partial bytes, or a length above the cap →
//!   [`FramingError::Protocol`]

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

use super::framelet::{Frame, Framelet};

/// Why a frame read stopped without producing a frame.
#[derive(Debug)]
pub enum FramingError {
    /// The stream failed.
    Io(std::io::Error),
    /// The byte stream violated the framing protocol.
    Protocol(String),
    /// The shutdown signal interrupted the read.
    Disconnecting,
}

impl std::fmt::Display for FramingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FramingError::Io(e) => write!(f, "I/O error: {e}"),
            FramingError::Protocol(msg) => write!(f, "protocol violation: {msg}"),
            FramingError::Disconnecting => write!(f, "disconnecting"),
        }
    }
}

impl std::error::Error for FramingError {}

/// Read one frame, or `Ok(None)` on clean EOF.
///
/// Cancelling `cancel` interrupts the read at the next suspension point and
/// surfaces as [`FramingError::Disconnecting`]. A framelet length above
/// `max_framelet_size` is rejected before any body allocation.
pub async fn read_frame<R>(
    reader: &mut R,
    cancel: &CancellationToken,
    max_framelet_size: u32,
) -> Result<Option<Frame>, FramingError>
where
    R: AsyncRead + Unpin,
{
    tokio::select! {
        biased;

        _ = cancel.cancelled() => Err(FramingError::Disconnecting),
        result = read_frame_inner(reader, max_framelet_size) => result,
    }
}

async fn read_frame_inner<R>(
    reader: &mut R,
    max_framelet_size: u32,
) -> Result<Option<Frame>, FramingError>
where
    R: AsyncRead + Unpin,
{
    // The count header is the only place a clean EOF is legal: zero bytes
    // here means the peer hung up between frames.
    let mut count_buf = [0u8; 2];
    let mut filled = 0usize;
    while filled < count_buf.len() {
        let n = reader
            .read(&mut count_buf[filled..])
            .await
            .map_err(FramingError::Io)?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(FramingError::Protocol(
                "stream ended inside a frame count".to_string(),
            ));
        }
        filled += n;
    }
    let framelet_count = u16::from_le_bytes(count_buf);

    let mut frame = Frame::new();
    for _ in 0..framelet_count {
        let tag = read_exact_u16_le(reader).await?;
        let length = read_exact_u32_le(reader).await?;

        if length > max_framelet_size {
            return Err(FramingError::Protocol(format!(
                "framelet length {length} exceeds maximum {max_framelet_size}"
            )));
        }

        let mut body = BytesMut::zeroed(length as usize);
        reader.read_exact(&mut body).await.map_err(map_body_error)?;
        frame.push(Framelet::raw(tag, body.freeze()));
    }

    Ok(Some(frame))
}

async fn read_exact_u16_le<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u16, FramingError> {
    let mut buf = [0u8; 2];
    reader.read_exact(&mut buf).await.map_err(map_body_error)?;
    Ok(u16::from_le_bytes(buf))
}

async fn read_exact_u32_le<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u32, FramingError> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf).await.map_err(map_body_error)?;
    Ok(u32::from_le_bytes(buf))
}

/// Past the count header, a truncated stream is a protocol violation, not a
/// hang-up.
fn map_body_error(e: std::io::Error) -> FramingError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        FramingError::Protocol("stream ended inside a frame".to_string())
    } else {
        FramingError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::framelet::{encode_frame, FrameletType};
    use bytes::Bytes;
    use std::io::Cursor;

    fn token() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn test_read_roundtrip() {
        let mut frame = Frame::new();
        frame.push(Framelet::new(
            FrameletType::EpoxyHeaders,
            Bytes::from_static(b"headers"),
        ));
        frame.push(Framelet::new(
            FrameletType::PayloadData,
            Bytes::from_static(b"payload"),
        ));

        let encoded = encode_frame(&frame);
        let mut cursor = Cursor::new(encoded.to_vec());

        let decoded = read_frame(&mut cursor, &token(), 1024).await.unwrap();
        assert_eq!(decoded, Some(frame));
    }

    #[tokio::test]
    async fn test_read_roundtrip_unknown_tag() {
        // Unknown tags survive decode; rejection is classification's job.
        let frame = Frame::single(Framelet::raw(0xBEEF, Bytes::from_static(b"x")));
        let mut cursor = Cursor::new(encode_frame(&frame).to_vec());

        let decoded = read_frame(&mut cursor, &token(), 1024).await.unwrap();
        assert_eq!(decoded, Some(frame));
    }

    #[tokio::test]
    async fn test_clean_eof_is_none() {
        let mut cursor = Cursor::new(Vec::new());
        let result = read_frame(&mut cursor, &token(), 1024).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_eof_inside_count_is_protocol_error() {
        let mut cursor = Cursor::new(vec![0x01]);
        let err = read_frame(&mut cursor, &token(), 1024).await.unwrap_err();
        assert!(matches!(err, FramingError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_eof_inside_framelet_is_protocol_error() {
        let frame = Frame::single(Framelet::new(
            FrameletType::PayloadData,
            Bytes::from_static(b"hello"),
        ));
        let encoded = encode_frame(&frame);

        // Drop the last two body bytes.
        let truncated = encoded[..encoded.len() - 2].to_vec();
        let mut cursor = Cursor::new(truncated);

        let err = read_frame(&mut cursor, &token(), 1024).await.unwrap_err();
        assert!(matches!(err, FramingError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_oversize_length_rejected_before_allocation() {
        // count=1, tag=PayloadData, length=u32::MAX, no body.
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&FrameletType::PayloadData.tag().to_le_bytes());
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());

        let mut cursor = Cursor::new(bytes);
        let err = read_frame(&mut cursor, &token(), 1024).await.unwrap_err();
        match err {
            FramingError::Protocol(msg) => assert!(msg.contains("exceeds maximum")),
            other => panic!("expected protocol error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_zero_count_frame_reads_as_empty() {
        let mut cursor = Cursor::new(vec![0x00, 0x00]);
        let frame = read_frame(&mut cursor, &token(), 1024)
            .await
            .unwrap()
            .unwrap();
        assert!(frame.is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_pending_read() {
        // A duplex with no data: the read parks until the token fires.
        let (mut near, _far) = tokio::io::duplex(64);
        let cancel = token();

        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            cancel_clone.cancel();
        });

        let err = read_frame(&mut near, &cancel, 1024).await.unwrap_err();
        assert!(matches!(err, FramingError::Disconnecting));
    }

    #[tokio::test]
    async fn test_two_frames_back_to_back() {
        let first = Frame::single(Framelet::new(
            FrameletType::EpoxyConfig,
            Bytes::from_static(b""),
        ));
        let second = Frame::single(Framelet::new(
            FrameletType::PayloadData,
            Bytes::from_static(b"next"),
        ));

        let mut bytes = encode_frame(&first).to_vec();
        bytes.extend_from_slice(&encode_frame(&second));
        let mut cursor = Cursor::new(bytes);

        let a = read_frame(&mut cursor, &token(), 1024).await.unwrap();
        let b = read_frame(&mut cursor, &token(), 1024).await.unwrap();
        let c = read_frame(&mut cursor, &token(), 1024).await.unwrap();

        assert_eq!(a, Some(first));
        assert_eq!(b, Some(second));
        assert!(c.is_none());
    }
}
