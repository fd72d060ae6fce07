//! PROXY protocol preamble decoding against the teacher's chosen `ppp`
//! crate, exercised from outside the crate as a black box.

use bytes::BytesMut;
use kafka_filter_proxy::haproxy::try_decode;
use rstest::rstest;

#[rstest]
#[case("PROXY TCP4 10.0.0.1 10.0.0.2 10000 20000\r\n", 1, true)]
#[case("PROXY TCP6 ::1 ::2 10000 20000\r\n", 1, true)]
#[case("PROXY UNKNOWN\r\n", 1, false)]
fn v1_preamble_decodes(#[case] text: &str, #[case] expected_version: u8, #[case] has_source: bool) {
    // Padded with bytes from the Kafka frame that would follow on the
    // wire, so short preambles (e.g. "PROXY UNKNOWN\r\n") still clear the
    // 16-byte lookahead `try_decode` needs before it will commit.
    let trailing = b"TRAILING-BYTES";
    let mut buf = BytesMut::from(text.as_bytes());
    buf.extend_from_slice(trailing);
    let preamble = try_decode(&mut buf)
        .expect("enough bytes to decide")
        .expect("a preamble was present");
    assert_eq!(preamble.version, expected_version);
    assert_eq!(preamble.source.is_some(), has_source);
    assert_eq!(&buf[..], trailing, "only the preamble itself is consumed");
}

#[test]
fn plain_kafka_request_is_not_mistaken_for_a_preamble() {
    // Length-prefixed ApiVersions request header, not a PROXY signature.
    let mut buf = BytesMut::from(&[0u8, 0, 0, 20, 0, 18, 0, 3, 0, 0, 0, 1][..]);
    assert_eq!(try_decode(&mut buf), Some(None));
}

#[test]
fn a_single_byte_is_not_enough_to_decide() {
    let mut buf = BytesMut::from(&b"P"[..]);
    assert_eq!(try_decode(&mut buf), None);
}
