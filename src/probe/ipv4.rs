use std::net::Ipv4Addr;

use super::checksum::{be_words, checksum};

/// IPv4 header size without options
pub const IPV4_HEADER_SIZE: usize = 20;

/// IP protocol numbers
pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_UDP: u8 = 17;

/// Option-less IPv4 header (RFC 791) as written into our probes.
///
/// Flags, fragment offset and TOS are always zero; the checksum is computed
/// by [`Ipv4Header::to_bytes`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    pub total_len: u16,
    pub identification: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
}

impl Ipv4Header {
    /// Serialize with the header checksum filled in
    pub fn to_bytes(&self) -> [u8; IPV4_HEADER_SIZE] {
        let mut bytes = [0u8; IPV4_HEADER_SIZE];

        bytes[0] = (4 << 4) | (IPV4_HEADER_SIZE / 4) as u8;
        bytes[2..4].copy_from_slice(&self.total_len.to_be_bytes());
        bytes[4..6].copy_from_slice(&self.identification.to_be_bytes());
        bytes[8] = self.ttl;
        bytes[9] = self.protocol;
        bytes[12..16].copy_from_slice(&self.source.octets());
        bytes[16..20].copy_from_slice(&self.destination.octets());

        let sum = checksum(&be_words(&bytes));
        bytes[10..12].copy_from_slice(&sum.to_be_bytes());

        bytes
    }
}
