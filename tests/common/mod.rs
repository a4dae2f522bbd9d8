//! Simulated network for driving the engine without raw sockets.
//!
//! Probes "sent" through [`SimSender`] are parsed and answered the way a real
//! path would answer them; replies are queued for [`SimReceiver`].
#![allow(dead_code)]

use pnet::packet::Packet;
use pnet::packet::icmp::echo_request::EchoRequestPacket;
use pnet::packet::icmp::{IcmpPacket, checksum as icmp_checksum};
use pnet::packet::ipv4::Ipv4Packet;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::net::Ipv4Addr;
use std::rc::Rc;
use std::time::Duration;

use rawtrace::probe::{
    IPPROTO_ICMP, IPPROTO_UDP, IPV4_HEADER_SIZE, Ipv4Header, ProbeSender, ReplyReceiver,
};

pub const SOURCE: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 50);
pub const TARGET: Ipv4Addr = Ipv4Addr::new(198, 51, 100, 7);
pub const TRACE_ID: u16 = 0x2A2A;

/// A path of routers ending at [`TARGET`]
pub struct Network {
    /// Router at each TTL before the target; `None` never answers
    pub routers: Vec<Option<Ipv4Addr>>,
    /// Target answers UDP probes with port unreachable
    pub udp_answers: bool,
    /// Target answers ICMP echo requests (with a valid checksum)
    pub echo_answers: bool,
    /// Echo requests the target dropped for a bad checksum
    pub bad_checksums: usize,
    /// Packets handed out before any real reply
    pub noise: VecDeque<Vec<u8>>,
    /// Fail every receive with this OS error
    pub receive_error: Option<i32>,
    pub sent: Vec<Vec<u8>>,
    pub timeouts_set: Vec<Duration>,
    replies: VecDeque<(Vec<u8>, Ipv4Addr)>,
}

impl Network {
    pub fn new(routers: Vec<Option<Ipv4Addr>>) -> Self {
        Self {
            routers,
            udp_answers: true,
            echo_answers: true,
            bad_checksums: 0,
            noise: VecDeque::new(),
            receive_error: None,
            sent: Vec::new(),
            timeouts_set: Vec::new(),
            replies: VecDeque::new(),
        }
    }

    /// TTL at which probes reach the target
    pub fn target_distance(&self) -> u8 {
        self.routers.len() as u8 + 1
    }

    pub fn shared(self) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(self))
    }

    /// Protocol number of every datagram sent so far
    pub fn sent_protocols(&self) -> Vec<u8> {
        self.sent.iter().map(|p| p[9]).collect()
    }

    fn answer(&mut self, probe: &[u8]) {
        let Some(ip) = Ipv4Packet::new(probe) else {
            return;
        };
        let ttl = ip.get_ttl();
        let protocol = ip.get_next_level_protocol().0;

        if ttl < self.target_distance() {
            if let Some(router) = self.routers[usize::from(ttl) - 1] {
                self.replies
                    .push_back((icmp_error(11, 0, router, probe), router));
            }
            return;
        }

        match protocol {
            IPPROTO_UDP if self.udp_answers => {
                self.replies
                    .push_back((icmp_error(3, 3, TARGET, probe), TARGET));
            }
            IPPROTO_ICMP if self.echo_answers => {
                let valid = IcmpPacket::new(ip.payload())
                    .is_some_and(|icmp| icmp.get_checksum() == icmp_checksum(&icmp));
                if !valid {
                    self.bad_checksums += 1;
                    return;
                }
                if let Some(echo) = EchoRequestPacket::new(ip.payload()) {
                    let reply = echo_reply(echo.get_identifier(), echo.get_sequence_number());
                    self.replies.push_back((reply, TARGET));
                }
            }
            _ => {}
        }
    }
}

pub struct SimSender(pub Rc<RefCell<Network>>);
pub struct SimReceiver(pub Rc<RefCell<Network>>);

pub fn endpoints(network: &Rc<RefCell<Network>>) -> (SimSender, SimReceiver) {
    (SimSender(network.clone()), SimReceiver(network.clone()))
}

impl ProbeSender for SimSender {
    fn send_probe(&mut self, packet: &[u8], target: Ipv4Addr) -> io::Result<usize> {
        assert_eq!(target, TARGET);
        let mut network = self.0.borrow_mut();
        network.sent.push(packet.to_vec());
        network.answer(packet);
        Ok(packet.len())
    }
}

impl ReplyReceiver for SimReceiver {
    fn set_receive_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.0.borrow_mut().timeouts_set.push(timeout);
        Ok(())
    }

    fn receive(&mut self, buf: &mut [u8]) -> io::Result<(usize, Ipv4Addr)> {
        let mut network = self.0.borrow_mut();
        if let Some(code) = network.receive_error {
            return Err(io::Error::from_raw_os_error(code));
        }

        let (packet, from) = match network.noise.pop_front() {
            Some(packet) => (packet, Ipv4Addr::new(203, 0, 113, 66)),
            None => network
                .replies
                .pop_front()
                .ok_or_else(|| io::Error::from(io::ErrorKind::WouldBlock))?,
        };

        buf[..packet.len()].copy_from_slice(&packet);
        Ok((packet.len(), from))
    }
}

/// Wrap an ICMP message in the IPv4 header a router would send to us
fn ip_wrap(from: Ipv4Addr, icmp: &[u8]) -> Vec<u8> {
    let header = Ipv4Header {
        total_len: (IPV4_HEADER_SIZE + icmp.len()) as u16,
        identification: 0x7777,
        ttl: 64,
        protocol: IPPROTO_ICMP,
        source: from,
        destination: SOURCE,
    };
    let mut packet = header.to_bytes().to_vec();
    packet.extend_from_slice(icmp);
    packet
}

/// ICMP error quoting the probe's IP header and first 8 payload bytes
pub fn icmp_error(icmp_type: u8, code: u8, from: Ipv4Addr, probe: &[u8]) -> Vec<u8> {
    let mut icmp = vec![icmp_type, code, 0, 0, 0, 0, 0, 0];
    icmp.extend_from_slice(&probe[..IPV4_HEADER_SIZE + 8]);
    ip_wrap(from, &icmp)
}

pub fn echo_reply(identifier: u16, sequence: u16) -> Vec<u8> {
    let mut icmp = vec![0, 0, 0, 0];
    icmp.extend_from_slice(&identifier.to_be_bytes());
    icmp.extend_from_slice(&sequence.to_be_bytes());
    icmp.extend_from_slice(&[0u8; 4]);
    ip_wrap(TARGET, &icmp)
}
