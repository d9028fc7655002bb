use bson::rawdoc;
use tokio::io::{duplex, AsyncWriteExt};

use super::{
    message::{DocumentSequence, Message},
    MessageFlags,
    RequestIdGenerator,
};
use crate::error::ErrorKind;

fn sample_message() -> Message {
    Message {
        response_to: 0,
        flags: MessageFlags::empty(),
        document_payload: rawdoc! { "insert": "coll", "ordered": true },
        document_sequences: vec![DocumentSequence {
            identifier: "documents".to_string(),
            documents: vec![rawdoc! { "x": 1 }, rawdoc! { "x": 2, "y": "z" }],
        }],
        checksum: None,
        request_id: Some(3),
    }
}

#[tokio::test]
async fn round_trip_with_document_sequence() {
    let message = sample_message();

    let (mut client, mut server) = duplex(64 * 1024);
    message.write_to(&mut client).await.unwrap();

    let read = Message::read_from(&mut server, None).await.unwrap();

    assert_eq!(read.response_to, 0);
    assert_eq!(read.document_payload, message.document_payload);
    assert_eq!(read.document_sequences, message.document_sequences);
    assert_eq!(read.checksum, None);
}

#[tokio::test]
async fn checksum_is_preserved() {
    let mut message = sample_message();
    message.flags |= MessageFlags::CHECKSUM_PRESENT;
    message.checksum = Some(1234);

    let (mut client, mut server) = duplex(64 * 1024);
    message.write_to(&mut client).await.unwrap();

    let read = Message::read_from(&mut server, None).await.unwrap();
    assert_eq!(read.checksum, Some(1234));
    assert_eq!(read.document_payload, message.document_payload);
}

#[tokio::test]
async fn reply_shorter_than_header_is_rejected() {
    // Header-only frame declaring a total length of 12 bytes.
    let bytes: Vec<u8> = [12i32, 1, 0, 2013]
        .iter()
        .flat_map(|i| i.to_le_bytes())
        .collect();

    let (mut client, mut server) = duplex(1024);
    client.write_all(&bytes).await.unwrap();

    let error = Message::read_from(&mut server, None).await.unwrap_err();
    assert!(matches!(
        *error.kind,
        ErrorKind::InvalidResponse { .. }
    ));
}

#[tokio::test]
async fn reply_longer_than_cap_is_rejected() {
    let bytes: Vec<u8> = [i32::MAX, 1, 0, 2013]
        .iter()
        .flat_map(|i| i.to_le_bytes())
        .collect();

    let (mut client, mut server) = duplex(1024);
    client.write_all(&bytes).await.unwrap();

    let error = Message::read_from(&mut server, None).await.unwrap_err();
    assert!(matches!(
        *error.kind,
        ErrorKind::InvalidResponse { .. }
    ));
}

#[tokio::test]
async fn unknown_opcode_is_rejected() {
    let bytes: Vec<u8> = [26i32, 1, 0, 2004]
        .iter()
        .flat_map(|i| i.to_le_bytes())
        .chain([0u8; 10])
        .collect();

    let (mut client, mut server) = duplex(1024);
    client.write_all(&bytes).await.unwrap();

    let error = Message::read_from(&mut server, None).await.unwrap_err();
    assert!(matches!(
        *error.kind,
        ErrorKind::InvalidResponse { .. }
    ));
}

#[tokio::test]
async fn invalid_bson_length_prefix_is_rejected() {
    // An OP_MSG whose kind-0 section declares a 3-byte document.
    let mut body = vec![0u8, 0, 0, 0, 0]; // flag bits + payload type 0
    body.extend_from_slice(&3i32.to_le_bytes());
    let total = (16 + body.len()) as i32;

    let mut bytes: Vec<u8> = [total, 1, 0, 2013]
        .iter()
        .flat_map(|i| i.to_le_bytes())
        .collect();
    bytes.extend_from_slice(&body);

    let (mut client, mut server) = duplex(1024);
    client.write_all(&bytes).await.unwrap();

    let error = Message::read_from(&mut server, None).await.unwrap_err();
    assert!(matches!(
        *error.kind,
        ErrorKind::InvalidResponse { .. }
    ));
}

#[test]
fn request_ids_start_at_one_and_wrap() {
    let generator = RequestIdGenerator::default();
    assert_eq!(generator.next_id(), 1);
    assert_eq!(generator.next_id(), 2);

    let generator = RequestIdGenerator::starting_at(i32::MAX - 1);
    assert_eq!(generator.next_id(), i32::MAX - 1);
    assert_eq!(generator.next_id(), i32::MAX);
    // Wraps back to 1, never 0 or negative.
    assert_eq!(generator.next_id(), 1);
}

#[cfg(any(
    feature = "zstd-compression",
    feature = "zlib-compression",
    feature = "snappy-compression"
))]
#[tokio::test]
async fn compressed_round_trip() {
    use crate::compression::Compressor;

    #[cfg(feature = "zlib-compression")]
    let compressor = Compressor::Zlib { level: None };
    #[cfg(all(feature = "zstd-compression", not(feature = "zlib-compression")))]
    let compressor = Compressor::Zstd { level: None };
    #[cfg(all(
        feature = "snappy-compression",
        not(feature = "zlib-compression"),
        not(feature = "zstd-compression")
    ))]
    let compressor = Compressor::Snappy;

    let message = sample_message();

    let (mut client, mut server) = duplex(64 * 1024);
    message
        .write_compressed_to(&mut client, &compressor)
        .await
        .unwrap();

    let read = Message::read_from(&mut server, None).await.unwrap();
    assert_eq!(read.document_payload, message.document_payload);
    assert_eq!(read.document_sequences, message.document_sequences);
}
