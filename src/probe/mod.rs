pub mod checksum;
pub mod correlate;
pub mod icmp;
pub mod ipv4;
pub mod socket;
pub mod udp;

pub use checksum::*;
pub use correlate::*;
pub use icmp::*;
pub use ipv4::*;
pub use socket::*;
pub use udp::*;
