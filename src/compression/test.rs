use super::{Compressor, CompressorId, Decoder};

const MESSAGE: &[u8] = b"{ \"insert\": \"coll\", \"documents\": [ { \"x\": 1 } ] } and some \
    padding to make the payload compressible aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

fn assert_round_trip(compressor: Compressor) {
    let compressed = compressor.compress(MESSAGE).unwrap();
    assert_ne!(compressed.as_slice(), MESSAGE);

    let decoder = Decoder::from_u8(compressor.id() as u8).unwrap();
    let decompressed = decoder.decode(&compressed).unwrap();
    assert_eq!(decompressed.as_slice(), MESSAGE);
}

#[cfg(feature = "zlib-compression")]
#[test]
fn zlib_round_trip() {
    assert_round_trip(Compressor::Zlib { level: None });
    assert_round_trip(Compressor::Zlib { level: Some(9) });
}

#[cfg(feature = "zstd-compression")]
#[test]
fn zstd_round_trip() {
    assert_round_trip(Compressor::Zstd { level: None });
}

#[cfg(feature = "snappy-compression")]
#[test]
fn snappy_round_trip() {
    assert_round_trip(Compressor::Snappy);
}

#[test]
fn compressor_ids_match_the_wire_protocol() {
    assert!(matches!(
        CompressorId::from_u8(0).unwrap(),
        CompressorId::Noop
    ));
    assert!(matches!(
        CompressorId::from_u8(1).unwrap(),
        CompressorId::Snappy
    ));
    assert!(matches!(
        CompressorId::from_u8(2).unwrap(),
        CompressorId::Zlib
    ));
    assert!(matches!(
        CompressorId::from_u8(3).unwrap(),
        CompressorId::Zstd
    ));
    assert!(CompressorId::from_u8(4).is_err());
}

#[cfg(feature = "zlib-compression")]
#[test]
fn invalid_levels_are_rejected() {
    assert!(Compressor::Zlib { level: Some(10) }.validate().is_err());
    assert!(Compressor::Zlib { level: Some(-1) }.validate().is_ok());
}

#[test]
fn unknown_names_are_rejected() {
    assert!(Compressor::parse_str("hufflepuff").is_err());
}
