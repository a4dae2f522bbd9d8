use std::net::Ipv4Addr;

use super::checksum::{be_words, checksum2};
use super::ipv4::{IPPROTO_ICMP, IPV4_HEADER_SIZE, Ipv4Header};
use super::udp::PROBE_PAYLOAD_SIZE;

/// ICMP header size (fixed)
pub const ICMP_HEADER_SIZE: usize = 8;
/// Whole ICMP probe datagram: IPv4 + ICMP echo + payload
pub const ICMP_PROBE_SIZE: usize = IPV4_HEADER_SIZE + ICMP_HEADER_SIZE + PROBE_PAYLOAD_SIZE;

// ICMP types (RFC 792)
pub const ICMP_TYPE_ECHO_REPLY: u8 = 0;
pub const ICMP_TYPE_UNREACHABLE: u8 = 3;
pub const ICMP_TYPE_ECHO: u8 = 8;
pub const ICMP_TYPE_TTL_EXCEEDED: u8 = 11;

// Destination unreachable codes that only the target host sends
pub const ICMP_CODE_PROTOCOL_UNREACHABLE: u8 = 2;
pub const ICMP_CODE_PORT_UNREACHABLE: u8 = 3;

/// ICMP echo request/reply header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcmpEchoHeader {
    pub icmp_type: u8,
    pub code: u8,
    pub checksum: u16,
    pub identifier: u16,
    pub sequence: u16,
}

impl IcmpEchoHeader {
    pub fn to_bytes(&self) -> [u8; ICMP_HEADER_SIZE] {
        let mut bytes = [0u8; ICMP_HEADER_SIZE];
        bytes[0] = self.icmp_type;
        bytes[1] = self.code;
        bytes[2..4].copy_from_slice(&self.checksum.to_be_bytes());
        bytes[4..6].copy_from_slice(&self.identifier.to_be_bytes());
        bytes[6..8].copy_from_slice(&self.sequence.to_be_bytes());
        bytes
    }

    /// Fill in the checksum over the whole ICMP message (header + `payload`)
    pub fn with_checksum(mut self, payload: &[u8]) -> Self {
        self.checksum = 0;
        self.checksum = checksum2(&be_words(&self.to_bytes()), &be_words(payload));
        self
    }
}

/// Build a header-included ICMP echo probe for one attempt.
///
/// `sequence` carries the correlation key (`base_port + probe sequence`).
pub fn build_icmp_probe(
    trace_id: u16,
    ttl: u8,
    source: Ipv4Addr,
    target: Ipv4Addr,
    sequence: u16,
) -> [u8; ICMP_PROBE_SIZE] {
    let ip = Ipv4Header {
        total_len: ICMP_PROBE_SIZE as u16,
        identification: trace_id,
        ttl,
        protocol: IPPROTO_ICMP,
        source,
        destination: target,
    };

    // Echo data stays zeroed
    let payload = [0u8; PROBE_PAYLOAD_SIZE];
    let echo = IcmpEchoHeader {
        icmp_type: ICMP_TYPE_ECHO,
        code: 0,
        checksum: 0,
        identifier: trace_id,
        sequence,
    }
    .with_checksum(&payload);

    let mut packet = [0u8; ICMP_PROBE_SIZE];
    packet[..IPV4_HEADER_SIZE].copy_from_slice(&ip.to_bytes());
    packet[IPV4_HEADER_SIZE..IPV4_HEADER_SIZE + ICMP_HEADER_SIZE].copy_from_slice(&echo.to_bytes());
    packet[IPV4_HEADER_SIZE + ICMP_HEADER_SIZE..].copy_from_slice(&payload);
    packet
}

#[cfg(test)]
mod tests {
    use super::*;
    use pnet::packet::Packet;
    use pnet::packet::icmp::echo_request::EchoRequestPacket;
    use pnet::packet::icmp::{IcmpPacket, IcmpTypes, checksum as icmp_checksum};
    use pnet::packet::ipv4::Ipv4Packet;

    const SOURCE: Ipv4Addr = Ipv4Addr::new(10, 1, 2, 3);
    const TARGET: Ipv4Addr = Ipv4Addr::new(9, 9, 9, 9);

    #[test]
    fn test_build_icmp_probe() {
        let packet = build_icmp_probe(0xABCD, 4, SOURCE, TARGET, 48135);
        assert_eq!(packet.len(), 32);

        let ip = Ipv4Packet::new(&packet).unwrap();
        assert_eq!(ip.get_total_length(), 32);
        assert_eq!(ip.get_identification(), 0xABCD);
        assert_eq!(ip.get_ttl(), 4);
        assert_eq!(ip.get_next_level_protocol().0, IPPROTO_ICMP);

        let echo = EchoRequestPacket::new(ip.payload()).unwrap();
        assert_eq!(echo.get_icmp_type(), IcmpTypes::EchoRequest);
        assert_eq!(echo.get_icmp_code().0, 0);
        assert_eq!(echo.get_identifier(), 0xABCD);
        assert_eq!(echo.get_sequence_number(), 48135);
    }

    #[test]
    fn test_icmp_checksum_covers_whole_message() {
        for (trace_id, sequence) in [(1, 48132), (0xABCD, 48135), (0xFFFF, 0xFFFF)] {
            let packet = build_icmp_probe(trace_id, 4, SOURCE, TARGET, sequence);
            let icmp = IcmpPacket::new(&packet[IPV4_HEADER_SIZE..]).unwrap();
            assert_eq!(icmp.payload().len(), 4 + PROBE_PAYLOAD_SIZE);
            assert_eq!(icmp.get_checksum(), icmp_checksum(&icmp));
        }
    }

    #[test]
    fn test_icmp_payload_is_zeroed() {
        let packet = build_icmp_probe(0xABCD, 4, SOURCE, TARGET, 48135);
        assert_eq!(packet[IPV4_HEADER_SIZE + ICMP_HEADER_SIZE..], [0u8; PROBE_PAYLOAD_SIZE]);
    }

    #[test]
    fn test_echo_header_checksum_resets_stale_value() {
        let header = IcmpEchoHeader {
            icmp_type: ICMP_TYPE_ECHO,
            code: 0,
            checksum: 0x1111,
            identifier: 5,
            sequence: 6,
        };
        let fresh = IcmpEchoHeader {
            checksum: 0,
            ..header
        };
        assert_eq!(header.with_checksum(&[]), fresh.with_checksum(&[]));

        // Payload words change the sum
        assert_ne!(fresh.with_checksum(&[0, 1]), fresh.with_checksum(&[]));
    }
}
