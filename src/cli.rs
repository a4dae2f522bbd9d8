use clap::{Parser, ValueEnum};
use std::net::Ipv4Addr;
use std::time::Duration;

use rawtrace::config::{MAX_PROBE_ATTEMPTS, MAX_TTL, TRACE_ROUTE_BASE_PORT, TraceConfig};
use rawtrace::state::{ProtocolSet, TraceMode};

/// Probe transports to start with
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolArg {
    Both,
    Udp,
    Icmp,
}

/// Raw-socket IPv4 traceroute and ping using UDP and ICMP probes
#[derive(Parser, Debug, Clone)]
#[command(name = "rawtrace")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Target host (IPv4 address or hostname)
    #[arg(required_unless_present = "replay")]
    pub target: Option<String>,

    /// Source address for probes (default: the address routing to the target)
    #[arg(long = "source")]
    pub source: Option<Ipv4Addr>,

    /// Ping the target at a fixed TTL instead of tracing the path
    #[arg(long = "ping")]
    pub ping: bool,

    /// Stop after this many events (0 = until done or Ctrl+C)
    #[arg(short = 'c', long = "count", default_value = "0")]
    pub count: u64,

    /// Trace identifier written into every probe (default: derived from the PID)
    #[arg(long = "trace-id")]
    pub trace_id: Option<u16>,

    /// Reply timeout per attempt in seconds
    #[arg(long = "timeout", default_value = "5")]
    pub timeout: f64,

    /// Maximum TTL (path discovery) or fixed TTL (ping)
    #[arg(short = 'm', long = "max-ttl", default_value_t = MAX_TTL)]
    pub max_ttl: u8,

    /// Attempts per hop
    #[arg(long = "attempts", default_value_t = MAX_PROBE_ATTEMPTS)]
    pub attempts: u8,

    /// Pause between ping rounds in seconds
    #[arg(short = 'i', long = "interval", default_value = "1.0")]
    pub interval: f64,

    /// Base for UDP destination ports and ICMP sequence numbers
    #[arg(long = "base-port", default_value_t = TRACE_ROUTE_BASE_PORT)]
    pub base_port: u16,

    /// Probe transports
    #[arg(short = 'p', long = "protocol", value_enum, default_value = "both")]
    pub protocol: ProtocolArg,

    /// Print events in the compact "ttl, addr, ms, udp" line format
    #[arg(long = "raw")]
    pub raw: bool,

    /// Output JSON when the run ends
    #[arg(long = "json", conflicts_with_all = ["csv", "report"])]
    pub json: bool,

    /// Output per-hop CSV when the run ends
    #[arg(long = "csv", conflicts_with = "report")]
    pub csv: bool,

    /// With --csv, write one row per event instead of per hop
    #[arg(long = "events", requires = "csv")]
    pub events: bool,

    /// Report mode (mtr --report style)
    #[arg(long = "report")]
    pub report: bool,

    /// Replay a saved JSON trace log
    #[arg(long = "replay")]
    pub replay: Option<String>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Seconds as a `Duration`; `None` when negative, not finite or too large
fn seconds(value: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(value).ok()
}

impl Args {
    /// Check if running in batch mode (non-interactive)
    pub fn is_batch_mode(&self) -> bool {
        self.json || self.csv || self.report
    }

    pub fn mode(&self) -> TraceMode {
        if self.ping {
            TraceMode::Ping
        } else {
            TraceMode::PathDiscovery
        }
    }

    pub fn protocols(&self) -> ProtocolSet {
        match self.protocol {
            ProtocolArg::Both => ProtocolSet::BOTH,
            ProtocolArg::Udp => ProtocolSet {
                udp: true,
                icmp: false,
            },
            ProtocolArg::Icmp => ProtocolSet {
                udp: false,
                icmp: true,
            },
        }
    }

    /// Engine settings from the command line
    pub fn trace_config(&self) -> TraceConfig {
        TraceConfig {
            probe_timeout: seconds(self.timeout).unwrap_or(Duration::MAX),
            max_ttl: self.max_ttl,
            attempts_per_hop: self.attempts,
            base_port: self.base_port,
            ping_interval: seconds(self.interval).unwrap_or(Duration::MAX),
            ..TraceConfig::default()
        }
    }

    /// Validate arguments
    pub fn validate(&self) -> Result<(), String> {
        if self.is_batch_mode() && self.ping && self.count == 0 {
            return Err(
                "Batch output modes (--json, --csv, --report) require -c with --ping".into(),
            );
        }

        if !seconds(self.timeout).is_some_and(|t| !t.is_zero()) {
            return Err("Timeout must be a positive number of seconds".into());
        }

        if seconds(self.interval).is_none() {
            return Err("Interval must be a non-negative number of seconds".into());
        }

        if self.max_ttl == 0 || self.max_ttl > MAX_TTL {
            return Err(format!("Max TTL must be between 1 and {}", MAX_TTL));
        }

        if self.attempts == 0 {
            return Err("At least one attempt per hop is required".into());
        }

        Ok(())
    }
}
