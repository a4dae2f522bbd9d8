use pnet::packet::icmp::IcmpPacket;
use pnet::packet::icmp::echo_reply::EchoReplyPacket;
use pnet::packet::icmp::echo_request::EchoRequestPacket;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::udp::UdpPacket;
use std::net::Ipv4Addr;
use thiserror::Error;

use super::icmp::{
    ICMP_HEADER_SIZE, ICMP_TYPE_ECHO_REPLY, ICMP_TYPE_TTL_EXCEEDED, ICMP_TYPE_UNREACHABLE,
};
use super::ipv4::{IPPROTO_ICMP, IPPROTO_UDP, IPV4_HEADER_SIZE};
use crate::state::{ProbeProtocol, ReplyKind};

/// Smallest packet worth looking at: outer IPv4 header plus ICMP header
pub const MIN_REPLY_SIZE: usize = IPV4_HEADER_SIZE + ICMP_HEADER_SIZE;

/// Bytes of the original datagram after its IP header that routers must quote (RFC 792)
const QUOTED_TRANSPORT_SIZE: usize = 8;

// ICMP error types that quote the offending datagram, besides 3 and 11
const ICMP_TYPE_SOURCE_QUENCH: u8 = 4;
const ICMP_TYPE_REDIRECT: u8 = 5;
const ICMP_TYPE_PARAMETER_PROBLEM: u8 = 12;

/// Identifies the outstanding probe a reply must match
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeKey {
    pub trace_id: u16,
    pub base_port: u16,
    pub sequence: u16,
}

impl ProbeKey {
    /// UDP destination port / ICMP sequence number written into the probe
    pub fn wire_value(&self) -> u16 {
        self.base_port.wrapping_add(self.sequence)
    }

    /// Recover the probe sequence from a port or ICMP sequence seen in a reply
    pub fn sequence_of(&self, wire_value: u16) -> u16 {
        wire_value.wrapping_sub(self.base_port)
    }

    fn check_sequence(&self, wire_value: u16) -> Result<(), Rejection> {
        let found = self.sequence_of(wire_value);
        if found == self.sequence {
            Ok(())
        } else {
            Err(Rejection::SequenceMismatch {
                expected: self.sequence,
                found,
            })
        }
    }
}

/// A reply that belongs to the outstanding probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchedReply {
    pub responder: Ipv4Addr,
    /// Transport of the probe that triggered the reply
    pub via: ProbeProtocol,
    pub kind: ReplyKind,
}

/// Why a received packet was not accepted. Never fatal.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    #[error("packet too short ({len} bytes)")]
    TooShort { len: usize },

    #[error("not an IPv4 packet carrying an ICMP header")]
    BadHeader,

    #[error("IP total length {declared} does not match {received} bytes received")]
    LengthMismatch { declared: u16, received: usize },

    #[error("ICMP type {0} does not quote a probe")]
    UnexpectedType(u8),

    #[error("quoted datagram missing or truncated")]
    BadQuote,

    #[error("identifier {0:#06x} belongs to another trace")]
    ForeignTrace(u16),

    #[error("quoted protocol {0} is not a probe transport")]
    UnsupportedProtocol(u8),

    #[error("sequence {found} does not match outstanding probe {expected}")]
    SequenceMismatch { expected: u16, found: u16 },
}

/// Validate a packet read from the raw ICMP socket and match it to the
/// outstanding probe.
///
/// Checks, in order: minimum size, outer IPv4 header and total length, then
/// either the echo reply identifier/sequence, or the datagram quoted inside an
/// ICMP error (identification, protocol, port/sequence).
pub fn correlate_reply(
    packet: &[u8],
    responder: Ipv4Addr,
    key: &ProbeKey,
) -> Result<MatchedReply, Rejection> {
    if packet.len() < MIN_REPLY_SIZE {
        return Err(Rejection::TooShort { len: packet.len() });
    }

    let ip = Ipv4Packet::new(packet).ok_or(Rejection::BadHeader)?;
    let ip_header_len = (ip.get_header_length() as usize) * 4;
    if ip.get_version() != 4
        || ip_header_len < IPV4_HEADER_SIZE
        || packet.len() < ip_header_len + ICMP_HEADER_SIZE
    {
        return Err(Rejection::BadHeader);
    }

    let declared = ip.get_total_length();
    if declared as usize != packet.len() {
        return Err(Rejection::LengthMismatch {
            declared,
            received: packet.len(),
        });
    }

    let icmp_data = &packet[ip_header_len..];
    let icmp = IcmpPacket::new(icmp_data).ok_or(Rejection::BadHeader)?;
    let icmp_type = icmp.get_icmp_type().0;
    let icmp_code = icmp.get_icmp_code().0;

    if icmp_type == ICMP_TYPE_ECHO_REPLY {
        let echo = EchoReplyPacket::new(icmp_data).ok_or(Rejection::BadHeader)?;
        if echo.get_identifier() != key.trace_id {
            return Err(Rejection::ForeignTrace(echo.get_identifier()));
        }
        key.check_sequence(echo.get_sequence_number())?;

        return Ok(MatchedReply {
            responder,
            via: ProbeProtocol::Icmp,
            kind: ReplyKind::EchoReply,
        });
    }

    if !matches!(
        icmp_type,
        ICMP_TYPE_UNREACHABLE
            | ICMP_TYPE_SOURCE_QUENCH
            | ICMP_TYPE_REDIRECT
            | ICMP_TYPE_TTL_EXCEEDED
            | ICMP_TYPE_PARAMETER_PROBLEM
    ) {
        return Err(Rejection::UnexpectedType(icmp_type));
    }

    let via = match_quoted_probe(&icmp_data[ICMP_HEADER_SIZE..], key)?;

    let kind = match icmp_type {
        ICMP_TYPE_TTL_EXCEEDED => ReplyKind::TimeExceeded,
        ICMP_TYPE_UNREACHABLE => ReplyKind::Unreachable { code: icmp_code },
        _ => ReplyKind::Other {
            icmp_type,
            code: icmp_code,
        },
    };

    Ok(MatchedReply {
        responder,
        via,
        kind,
    })
}

/// Match the IP header + 8 transport bytes quoted in an ICMP error
fn match_quoted_probe(quoted: &[u8], key: &ProbeKey) -> Result<ProbeProtocol, Rejection> {
    let inner = Ipv4Packet::new(quoted).ok_or(Rejection::BadQuote)?;
    let inner_header_len = (inner.get_header_length() as usize) * 4;
    if inner.get_version() != 4
        || inner_header_len < IPV4_HEADER_SIZE
        || quoted.len() < inner_header_len + QUOTED_TRANSPORT_SIZE
    {
        return Err(Rejection::BadQuote);
    }

    let identification = inner.get_identification();
    if identification != key.trace_id {
        return Err(Rejection::ForeignTrace(identification));
    }

    let transport = &quoted[inner_header_len..];
    match inner.get_next_level_protocol().0 {
        IPPROTO_ICMP => {
            let echo = EchoRequestPacket::new(transport).ok_or(Rejection::BadQuote)?;
            key.check_sequence(echo.get_sequence_number())?;
            Ok(ProbeProtocol::Icmp)
        }
        IPPROTO_UDP => {
            let udp = UdpPacket::new(transport).ok_or(Rejection::BadQuote)?;
            key.check_sequence(udp.get_destination())?;
            Ok(ProbeProtocol::Udp)
        }
        other => Err(Rejection::UnsupportedProtocol(other)),
    }
}
