//! HA-PROXY protocol v1/v2 preamble decode (spec §6 "Ingress wire
//! format"). Grounded in the `ppp` crate usage seen in
//! `other_examples/manifests/Ikaleio-geofront` and
//! `other_examples/manifests/npolshakova-agentgateway`.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::{Buf, BytesMut};
use ppp::{v1, v2, HeaderResult};

/// Source/destination addresses carried by a PROXY protocol preamble,
/// as remembered by the `HaProxy` session state (spec §3).
#[derive(Debug, Clone)]
pub struct HaProxyPreamble {
    pub version: u8,
    pub source: Option<(IpAddr, u16)>,
    pub destination: Option<(IpAddr, u16)>,
    /// Bytes the preamble itself occupied on the wire.
    pub wire_len: usize,
}

/// Attempts to decode a PROXY preamble from the front of `src`.
///
/// Returns `Ok(None)` if `src` does not yet hold enough bytes to
/// determine whether a preamble is present, `Ok(Some(None))` if the
/// stream definitely does not start with a preamble (caller should
/// proceed straight to Kafka framing), and `Ok(Some(Some(preamble)))`
/// with the bytes consumed if one was found.
pub fn try_decode(src: &mut BytesMut) -> Option<Option<HaProxyPreamble>> {
    if src.len() < 16 {
        // Neither the v1 "PROXY " nor the v2 12-byte binary signature
        // can be confirmed absent or present yet.
        if !could_be_preamble(src) {
            return Some(None);
        }
        return None;
    }

    match HeaderResult::parse(src) {
        HeaderResult::V1(Ok(header)) => {
            let consumed = header_text_len(&header);
            let mut preamble = preamble_from_v1(&header);
            preamble.wire_len = consumed;
            src.advance(consumed);
            Some(Some(preamble))
        }
        HeaderResult::V2(Ok(header)) => {
            let consumed = header.header.len();
            let mut preamble = preamble_from_v2(&header);
            preamble.wire_len = consumed;
            src.advance(consumed);
            Some(Some(preamble))
        }
        HeaderResult::V1(Err(_)) | HeaderResult::V2(Err(_)) => {
            if could_be_preamble(src) {
                None
            } else {
                Some(None)
            }
        }
    }
}

fn could_be_preamble(src: &[u8]) -> bool {
    const V2_SIG: [u8; 12] = [
        0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
    ];
    let n = src.len().min(V2_SIG.len());
    if src[..n] == V2_SIG[..n] {
        return true;
    }
    const V1_SIG: &[u8] = b"PROXY ";
    let n = src.len().min(V1_SIG.len());
    src[..n] == V1_SIG[..n]
}

fn header_text_len(header: &v1::Header) -> usize {
    header.header.len()
}

fn preamble_from_v1(header: &v1::Header) -> HaProxyPreamble {
    match &header.addresses {
        v1::Addresses::Tcp4 {
            source_address,
            destination_address,
            source_port,
            destination_port,
        } => HaProxyPreamble {
            version: 1,
            source: Some((IpAddr::V4(*source_address), *source_port)),
            destination: Some((IpAddr::V4(*destination_address), *destination_port)),
            wire_len: 0,
        },
        v1::Addresses::Tcp6 {
            source_address,
            destination_address,
            source_port,
            destination_port,
        } => HaProxyPreamble {
            version: 1,
            source: Some((IpAddr::V6(*source_address), *source_port)),
            destination: Some((IpAddr::V6(*destination_address), *destination_port)),
            wire_len: 0,
        },
        v1::Addresses::Unknown => HaProxyPreamble {
            version: 1,
            source: None,
            destination: None,
            wire_len: 0,
        },
    }
}

fn preamble_from_v2(header: &v2::Header) -> HaProxyPreamble {
    match header.addresses {
        v2::Addresses::IPv4(addrs) => HaProxyPreamble {
            version: 2,
            source: Some((
                IpAddr::V4(Ipv4Addr::from(addrs.source_address)),
                addrs.source_port,
            )),
            destination: Some((
                IpAddr::V4(Ipv4Addr::from(addrs.destination_address)),
                addrs.destination_port,
            )),
            wire_len: 0,
        },
        v2::Addresses::IPv6(addrs) => HaProxyPreamble {
            version: 2,
            source: Some((
                IpAddr::V6(Ipv6Addr::from(addrs.source_address)),
                addrs.source_port,
            )),
            destination: Some((
                IpAddr::V6(Ipv6Addr::from(addrs.destination_address)),
                addrs.destination_port,
            )),
            wire_len: 0,
        },
        _ => HaProxyPreamble {
            version: 2,
            source: None,
            destination: None,
            wire_len: 0,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incomplete_buffer_waits_for_more_bytes() {
        let mut buf = BytesMut::from(&b"PROX"[..]);
        assert_eq!(try_decode(&mut buf).map(|x| x.is_some()), None);
    }

    #[test]
    fn non_preamble_kafka_bytes_return_none() {
        // A plausible Kafka request length-prefix + api key, which is
        // not a valid PROXY signature.
        let mut buf = BytesMut::from(&[0u8, 0, 0, 20, 0, 18, 0, 3][..]);
        assert_eq!(try_decode(&mut buf), Some(None));
    }
}
