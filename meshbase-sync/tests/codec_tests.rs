//! Tests for the length-prefixed codec: framing errors and edge cases.

use meshbase_sync::codec::{read_message, write_message, MAX_MESSAGE_SIZE};
use meshbase_sync::protocol::{ErrorMessage, MeshMessage, XprisoMessage};
use meshbase_types::NetMeshBaseIdentifier;
use std::io::Cursor;

/// Helper: write a raw length-prefixed payload into a buffer.
fn make_length_prefixed(payload: &[u8]) -> Vec<u8> {
    let len = payload.len() as u32;
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

fn mb(s: &str) -> NetMeshBaseIdentifier {
    s.parse().unwrap()
}

#[tokio::test]
async fn roundtrip_ping() {
    let mut buf = Vec::new();
    write_message(&mut buf, &MeshMessage::Ping(42)).await.unwrap();

    let mut reader = buf.as_slice();
    match read_message(&mut reader).await.unwrap() {
        MeshMessage::Ping(v) => assert_eq!(v, 42),
        other => panic!("expected Ping, got {:?}", other),
    }
}

#[tokio::test]
async fn roundtrip_xpriso_request() {
    let mut request = XprisoMessage::new(mb("http://a.example/"), mb("http://b.example/"));
    request.request_id = 7;
    request.cease_communications = true;
    let msg = MeshMessage::Xpriso(request);

    let mut buf = Cursor::new(Vec::new());
    write_message(&mut buf, &msg).await.unwrap();

    let mut reader = Cursor::new(buf.into_inner());
    assert_eq!(read_message(&mut reader).await.unwrap(), msg);
}

#[tokio::test]
async fn several_messages_on_one_stream() {
    let mut buf = Vec::new();
    write_message(&mut buf, &MeshMessage::Ping(1)).await.unwrap();
    write_message(&mut buf, &MeshMessage::Error(ErrorMessage::internal("boom")))
        .await
        .unwrap();

    let mut reader = buf.as_slice();
    assert_eq!(read_message(&mut reader).await.unwrap(), MeshMessage::Ping(1));
    match read_message(&mut reader).await.unwrap() {
        MeshMessage::Error(e) => {
            assert_eq!(e.code, ErrorMessage::INTERNAL);
            assert_eq!(e.message, "boom");
        }
        other => panic!("expected Error, got {:?}", other),
    }
    let eof = read_message(&mut reader).await.unwrap_err();
    assert_eq!(eof.kind(), std::io::ErrorKind::UnexpectedEof);
}

#[tokio::test]
async fn read_message_too_large() {
    let huge_len = u32::try_from(MAX_MESSAGE_SIZE).unwrap() + 1;
    let data = huge_len.to_be_bytes().to_vec();

    let mut reader = data.as_slice();
    let err = read_message(&mut reader).await.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    assert!(err.to_string().contains("message too large"));
}

#[tokio::test]
async fn read_message_invalid_json() {
    let data = make_length_prefixed(b"this is not json");

    let mut reader = data.as_slice();
    let err = read_message(&mut reader).await.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    assert!(err.to_string().contains("JSON decode error"));
}

#[tokio::test]
async fn read_message_unknown_variant() {
    let data = make_length_prefixed(br#"{"Gossip":1}"#);

    let mut reader = data.as_slice();
    let err = read_message(&mut reader).await.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
}

#[tokio::test]
async fn read_message_truncated_length() {
    let data = [0u8, 1];
    let mut reader = &data[..];
    let err = read_message(&mut reader).await.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
}

#[tokio::test]
async fn read_message_truncated_payload() {
    let mut data = make_length_prefixed(br#"{"Ping":5}"#);
    data.truncate(data.len() - 2);

    let mut reader = data.as_slice();
    let err = read_message(&mut reader).await.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
}

#[tokio::test]
async fn length_prefix_is_big_endian() {
    let mut buf = Vec::new();
    write_message(&mut buf, &MeshMessage::Pong(3)).await.unwrap();

    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    assert_eq!(len, buf.len() - 4);
    let body: serde_json::Value = serde_json::from_slice(&buf[4..]).unwrap();
    assert_eq!(body, serde_json::json!({ "Pong": 3 }));
}
