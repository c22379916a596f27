//! Integration tests for epoxy-core.
//!
//! These tests verify the interplay between framing, classification, and
//! the MsgPack codec through the public API.

use bytes::Bytes;
use epoxy_core::codec::MsgPackCodec;
use epoxy_core::message::{status, EpoxyConfig, EpoxyHeaders};
use epoxy_core::protocol::{
    classify, encode_frame, read_frame, Disposition, Frame, Framelet, FrameletType,
};
use epoxy_core::{Error, ProtocolError, ProtocolErrorCode};
use std::io::Cursor;
use tokio_util::sync::CancellationToken;

fn message_frame(headers: &EpoxyHeaders, payload: &[u8]) -> Frame {
    let mut frame = Frame::new();
    frame.push(Framelet::new(
        FrameletType::EpoxyHeaders,
        MsgPackCodec::encode(headers).unwrap(),
    ));
    frame.push(Framelet::new(
        FrameletType::PayloadData,
        Bytes::copy_from_slice(payload),
    ));
    frame
}

/// Full cycle: build a request frame, push it through the wire encoding,
/// read it back, classify it, and decode the payload.
#[tokio::test]
async fn test_request_frame_full_cycle() {
    #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
    struct AddRequest {
        lhs: i64,
        rhs: i64,
    }

    let request = AddRequest { lhs: 20, rhs: 22 };
    let payload = MsgPackCodec::encode(&request).unwrap();
    let frame = message_frame(&EpoxyHeaders::request(1, "Add"), &payload);

    let encoded = encode_frame(&frame);
    let mut cursor = Cursor::new(encoded.to_vec());
    let decoded = read_frame(&mut cursor, &CancellationToken::new(), 1024 * 1024)
        .await
        .unwrap()
        .expect("one frame on the wire");
    assert_eq!(decoded, frame);

    match classify(&decoded) {
        Disposition::DeliverRequest(inbound) => {
            assert_eq!(inbound.headers.conversation_id, 1);
            assert_eq!(inbound.headers.method_name, "Add");
            assert_eq!(inbound.headers.error_code, status::OK);
            let parsed: AddRequest = MsgPackCodec::decode(&inbound.payload).unwrap();
            assert_eq!(parsed, request);
        }
        other => panic!("expected DeliverRequest, got {other:?}"),
    }
}

/// An error-bearing response survives the wire and classifies as a
/// response delivery.
#[tokio::test]
async fn test_error_response_full_cycle() {
    let error = Error::new(status::INTERNAL_SERVER_ERROR, "it broke");
    let payload = MsgPackCodec::encode(&error).unwrap();
    let frame = message_frame(
        &EpoxyHeaders::response(9, status::INTERNAL_SERVER_ERROR),
        &payload,
    );

    let mut cursor = Cursor::new(encode_frame(&frame).to_vec());
    let decoded = read_frame(&mut cursor, &CancellationToken::new(), 1024 * 1024)
        .await
        .unwrap()
        .unwrap();

    match classify(&decoded) {
        Disposition::DeliverResponse(inbound) => {
            assert_eq!(inbound.headers.error_code, status::INTERNAL_SERVER_ERROR);
            assert!(inbound.headers.method_name.is_empty());
            let parsed: Error = MsgPackCodec::decode(&inbound.payload).unwrap();
            assert_eq!(parsed, error);
        }
        other => panic!("expected DeliverResponse, got {other:?}"),
    }
}

/// Config and protocol-error frames classify to their dispositions after a
/// wire round trip.
#[tokio::test]
async fn test_control_frames_full_cycle() {
    let config = Frame::single(Framelet::new(
        FrameletType::EpoxyConfig,
        MsgPackCodec::encode(&EpoxyConfig {}).unwrap(),
    ));
    let mut cursor = Cursor::new(encode_frame(&config).to_vec());
    let decoded = read_frame(&mut cursor, &CancellationToken::new(), 1024)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(classify(&decoded), Disposition::ProcessConfig);

    let report = ProtocolError {
        error_code: ProtocolErrorCode::ConnectionRejected,
        details: Some(Error::new(42, "nope")),
    };
    let frame = Frame::single(Framelet::new(
        FrameletType::ProtocolError,
        MsgPackCodec::encode(&report).unwrap(),
    ));
    let mut cursor = Cursor::new(encode_frame(&frame).to_vec());
    let decoded = read_frame(&mut cursor, &CancellationToken::new(), 1024)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(classify(&decoded), Disposition::HandleProtocolError(report));
}

/// Multiple frames written back to back come out one by one, in order.
#[tokio::test]
async fn test_frame_sequence_preserved() {
    let mut wire = Vec::new();
    for conversation_id in [1u64, 3, 5] {
        let payload = MsgPackCodec::encode(&format!("message_{conversation_id}")).unwrap();
        let frame = message_frame(&EpoxyHeaders::event(conversation_id, "Tick"), &payload);
        wire.extend_from_slice(&encode_frame(&frame));
    }

    let mut cursor = Cursor::new(wire);
    let cancel = CancellationToken::new();
    for expected_id in [1u64, 3, 5] {
        let frame = read_frame(&mut cursor, &cancel, 1024 * 1024)
            .await
            .unwrap()
            .unwrap();
        match classify(&frame) {
            Disposition::DeliverEvent(inbound) => {
                assert_eq!(inbound.headers.conversation_id, expected_id);
                let text: String = MsgPackCodec::decode(&inbound.payload).unwrap();
                assert_eq!(text, format!("message_{expected_id}"));
            }
            other => panic!("expected DeliverEvent, got {other:?}"),
        }
    }
    assert!(read_frame(&mut cursor, &cancel, 1024)
        .await
        .unwrap()
        .is_none());
}

/// Corrupting a length field either produces a well-formed frame or a
/// protocol violation; never a giant allocation.
#[tokio::test]
async fn test_length_corruption_bounded() {
    let payload = MsgPackCodec::encode(&"resilient").unwrap();
    let frame = message_frame(&EpoxyHeaders::request(1, "Echo"), &payload);
    let encoded = encode_frame(&frame).to_vec();

    // The first framelet's length field lives at bytes 4..8.
    for corrupt in [0x40u8, 0xFF] {
        let mut bytes = encoded.clone();
        bytes[7] = corrupt;
        let mut cursor = Cursor::new(bytes);
        let result = read_frame(&mut cursor, &CancellationToken::new(), 64 * 1024).await;
        match result {
            Ok(Some(_)) | Ok(None) => {}
            Err(e) => assert!(
                format!("{e}").contains("protocol violation"),
                "unexpected failure kind: {e}"
            ),
        }
    }
}
