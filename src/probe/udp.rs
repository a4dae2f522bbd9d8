use std::net::Ipv4Addr;

use super::checksum::{be_words, checksum2};
use super::ipv4::{IPPROTO_UDP, IPV4_HEADER_SIZE, Ipv4Header};

/// UDP header size (fixed)
pub const UDP_HEADER_SIZE: usize = 8;
/// Payload carried by every probe
pub const PROBE_PAYLOAD_SIZE: usize = 4;
/// Payload value; routers quote it back but nothing reads it
pub const PROBE_PAYLOAD: u32 = 1234;
/// Whole UDP probe datagram: IPv4 + UDP + payload
pub const UDP_PROBE_SIZE: usize = IPV4_HEADER_SIZE + UDP_HEADER_SIZE + PROBE_PAYLOAD_SIZE;

/// UDP header (RFC 768)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader {
    pub source_port: u16,
    pub dest_port: u16,
    /// Header plus payload
    pub length: u16,
    pub checksum: u16,
}

impl UdpHeader {
    pub fn to_bytes(&self) -> [u8; UDP_HEADER_SIZE] {
        let mut bytes = [0u8; UDP_HEADER_SIZE];
        bytes[0..2].copy_from_slice(&self.source_port.to_be_bytes());
        bytes[2..4].copy_from_slice(&self.dest_port.to_be_bytes());
        bytes[4..6].copy_from_slice(&self.length.to_be_bytes());
        bytes[6..8].copy_from_slice(&self.checksum.to_be_bytes());
        bytes
    }
}

/// Checksum-only header prepended to the UDP segment. Never transmitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PseudoHeader {
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub protocol: u8,
    pub udp_length: u16,
}

impl PseudoHeader {
    pub fn to_bytes(&self) -> [u8; 12] {
        let mut bytes = [0u8; 12];
        bytes[0..4].copy_from_slice(&self.source.octets());
        bytes[4..8].copy_from_slice(&self.destination.octets());
        // bytes[8] stays zero
        bytes[9] = self.protocol;
        bytes[10..12].copy_from_slice(&self.udp_length.to_be_bytes());
        bytes
    }
}

/// Build a header-included UDP probe for one attempt.
///
/// `dest_port` carries the correlation key (`base_port + sequence`).
pub fn build_udp_probe(
    trace_id: u16,
    ttl: u8,
    source: Ipv4Addr,
    target: Ipv4Addr,
    source_port: u16,
    dest_port: u16,
) -> [u8; UDP_PROBE_SIZE] {
    let udp_length = (UDP_HEADER_SIZE + PROBE_PAYLOAD_SIZE) as u16;

    let ip = Ipv4Header {
        total_len: UDP_PROBE_SIZE as u16,
        identification: trace_id,
        ttl,
        protocol: IPPROTO_UDP,
        source,
        destination: target,
    };

    let mut udp = UdpHeader {
        source_port,
        dest_port,
        length: udp_length,
        checksum: 0,
    };

    let pseudo = PseudoHeader {
        source,
        destination: target,
        protocol: IPPROTO_UDP,
        udp_length,
    };

    let payload = PROBE_PAYLOAD.to_be_bytes();

    let mut segment = [0u8; UDP_HEADER_SIZE + PROBE_PAYLOAD_SIZE];
    segment[..UDP_HEADER_SIZE].copy_from_slice(&udp.to_bytes());
    segment[UDP_HEADER_SIZE..].copy_from_slice(&payload);
    udp.checksum = checksum2(&be_words(&pseudo.to_bytes()), &be_words(&segment));

    let mut packet = [0u8; UDP_PROBE_SIZE];
    packet[..IPV4_HEADER_SIZE].copy_from_slice(&ip.to_bytes());
    packet[IPV4_HEADER_SIZE..IPV4_HEADER_SIZE + UDP_HEADER_SIZE].copy_from_slice(&udp.to_bytes());
    packet[IPV4_HEADER_SIZE + UDP_HEADER_SIZE..].copy_from_slice(&payload);
    packet
}
