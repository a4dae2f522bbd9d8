use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::mem::MaybeUninit;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{TraceError, TraceResult};

/// IPPROTO_RAW: send-only raw socket, IP header supplied by the caller
const IPPROTO_RAW: i32 = 255;

/// Receive buffer requested for the ICMP socket
const RECV_BUFFER_SIZE: usize = 1024 * 1024;

/// Sends header-included probe datagrams
pub trait ProbeSender {
    /// Send one complete IPv4 datagram to `target`, returning bytes written
    fn send_probe(&mut self, packet: &[u8], target: Ipv4Addr) -> io::Result<usize>;
}

/// Receives raw ICMP replies (IPv4 header included)
pub trait ReplyReceiver {
    fn set_receive_timeout(&mut self, timeout: Duration) -> io::Result<()>;

    /// Block until a packet arrives or the receive timeout fires.
    ///
    /// A timeout is reported as `WouldBlock` or `TimedOut` (see [`is_timeout`]).
    fn receive(&mut self, buf: &mut [u8]) -> io::Result<(usize, Ipv4Addr)>;
}

impl ProbeSender for Socket {
    fn send_probe(&mut self, packet: &[u8], target: Ipv4Addr) -> io::Result<usize> {
        let addr = SockAddr::from(SocketAddrV4::new(target, 0));
        self.send_to(packet, &addr)
    }
}

impl ReplyReceiver for Socket {
    fn set_receive_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        // A zero read timeout means "block forever" to the OS
        let timeout = timeout.max(Duration::from_millis(1));
        self.set_read_timeout(Some(timeout))
    }

    fn receive(&mut self, buf: &mut [u8]) -> io::Result<(usize, Ipv4Addr)> {
        // SAFETY: recv_from only writes initialized bytes into the buffer and
        // u8 has no invalid bit patterns, so viewing it as MaybeUninit is sound.
        let uninit = unsafe { &mut *(buf as *mut [u8] as *mut [MaybeUninit<u8>]) };
        let (len, from) = self.recv_from(uninit)?;
        let from = from.as_socket_ipv4().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "reply from non-IPv4 address")
        })?;
        Ok((len, *from.ip()))
    }
}

impl<T: ProbeSender + ?Sized> ProbeSender for &mut T {
    fn send_probe(&mut self, packet: &[u8], target: Ipv4Addr) -> io::Result<usize> {
        (**self).send_probe(packet, target)
    }
}

impl<T: ReplyReceiver + ?Sized> ReplyReceiver for &mut T {
    fn set_receive_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        (**self).set_receive_timeout(timeout)
    }

    fn receive(&mut self, buf: &mut [u8]) -> io::Result<(usize, Ipv4Addr)> {
        (**self).receive(buf)
    }
}

/// True when a receive error only means the timeout expired
pub fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

/// Create the raw ICMPv4 socket replies are read from, bound to `source`
pub fn open_receive_socket(source: Ipv4Addr, timeout: Duration) -> TraceResult<Socket> {
    let mut socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))
        .map_err(TraceError::socket("socket"))?;

    socket
        .set_reuse_address(true)
        .map_err(TraceError::socket("setsockopt(SO_REUSEADDR)"))?;
    socket
        .set_receive_timeout(timeout)
        .map_err(TraceError::socket("setsockopt(SO_RCVTIMEO)"))?;
    if let Err(e) = socket.set_recv_buffer_size(RECV_BUFFER_SIZE) {
        warn!("could not enlarge receive buffer: {}", e);
    }

    let local = SockAddr::from(SocketAddrV4::new(source, 0));
    socket.bind(&local).map_err(TraceError::socket("bind"))?;

    debug!(%source, "receive socket ready");
    Ok(socket)
}

/// Create the raw socket probes are sent on (we write the IP header)
pub fn open_send_socket() -> TraceResult<Socket> {
    let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::from(IPPROTO_RAW)))
        .map_err(TraceError::socket("socket"))?;
    socket
        .set_header_included(true)
        .map_err(TraceError::socket("setsockopt(IP_HDRINCL)"))?;
    Ok(socket)
}

/// The send/receive socket pair for one trace. Both close when dropped.
#[derive(Debug)]
pub struct TraceSockets {
    sender: Socket,
    receiver: Socket,
}

impl TraceSockets {
    pub fn open(source: Ipv4Addr, timeout: Duration) -> TraceResult<Self> {
        let receiver = open_receive_socket(source, timeout)?;
        let sender = open_send_socket()?;
        Ok(Self { sender, receiver })
    }

    /// Borrow the pair for one engine run
    pub fn split(&mut self) -> (&mut Socket, &mut Socket) {
        (&mut self.sender, &mut self.receiver)
    }
}

/// Local address the kernel would route `target` from.
///
/// Uses the UDP connect trick: nothing is sent.
pub fn detect_source_ip(target: Ipv4Addr) -> io::Result<Ipv4Addr> {
    let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))?;
    socket.connect(SocketAddrV4::new(target, 80))?;
    match socket.local_addr()? {
        SocketAddr::V4(addr) if !addr.ip().is_unspecified() => Ok(*addr.ip()),
        other => Err(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no usable IPv4 source address (got {})", other.ip()),
        )),
    }
}

/// Verify raw sockets can be created, with fix hints when they cannot
pub fn check_permissions() -> anyhow::Result<()> {
    let raw = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4));
    if raw.is_ok() {
        return Ok(());
    }

    let binary_path = std::env::current_exe()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| "rawtrace".to_string());

    Err(anyhow::anyhow!(
        "Insufficient permissions for raw sockets.\n\n\
         Fix options:\n\
         \u{2022} Run with sudo: sudo rawtrace <target>\n\
         \u{2022} Add capability: sudo setcap cap_net_raw+ep {}",
        binary_path
    ))
}
