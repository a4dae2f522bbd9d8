//! Raw-socket IPv4 traceroute and ping.
//!
//! The engine sends header-included UDP and ICMP echo probes with increasing
//! TTL (or a fixed TTL in ping mode), matches ICMP replies back to the
//! outstanding probe and streams each result to a [`trace::Reporter`].

// Public API - data types and export functions
pub mod config;
pub mod error;
pub mod export;
pub mod state;

// Packet building, sockets and the prober
pub mod probe;
pub mod trace;

pub use error::{TraceError, TraceResult};
pub use trace::{TraceEngine, TraceSummary, trace_route};
