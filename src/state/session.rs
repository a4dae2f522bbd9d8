use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use crate::probe::{ICMP_CODE_PORT_UNREACHABLE, ICMP_CODE_PROTOCOL_UNREACHABLE};

/// How the engine drives TTLs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceMode {
    /// Classic traceroute: TTL 1, 2, ... until the target answers
    #[default]
    PathDiscovery,
    /// Fixed maximum TTL, repeated round-trip measurement to the target
    Ping,
}

/// Transport of a probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeProtocol {
    Udp,
    Icmp,
}

impl fmt::Display for ProbeProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Udp => f.write_str("UDP"),
            Self::Icmp => f.write_str("ICMP"),
        }
    }
}

/// Parameters of one engine run. Sockets are passed to the engine separately
/// and stay owned by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceSession {
    /// Written to the IP identification and ICMP identifier fields
    pub trace_id: u16,
    pub source: Ipv4Addr,
    pub target: Ipv4Addr,
    pub mode: TraceMode,
}

impl TraceSession {
    pub fn new(trace_id: u16, source: Ipv4Addr, target: Ipv4Addr, mode: TraceMode) -> Self {
        Self {
            trace_id,
            source,
            target,
            mode,
        }
    }

    pub fn is_ping(&self) -> bool {
        self.mode == TraceMode::Ping
    }
}

/// Which probe transports are still in use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolSet {
    pub udp: bool,
    pub icmp: bool,
}

impl ProtocolSet {
    pub const BOTH: Self = Self {
        udp: true,
        icmp: true,
    };

    pub fn is_empty(&self) -> bool {
        !self.udp && !self.icmp
    }

    /// Keep only the transport that just proved the target reachable
    pub fn narrow_to(&mut self, protocol: ProbeProtocol) {
        match protocol {
            ProbeProtocol::Udp => self.icmp = false,
            ProbeProtocol::Icmp => self.udp = false,
        }
    }
}

/// One send attempt, awaiting its reply
#[derive(Debug, Clone, Copy)]
pub struct Probe {
    pub ttl: u8,
    pub sequence: u16,
    pub protocols: ProtocolSet,
    pub sent_at: Instant,
}

/// What the matched ICMP message said about the probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ReplyKind {
    /// The target answered an ICMP echo probe directly
    EchoReply,
    /// An intermediate router dropped the probe
    TimeExceeded,
    /// Destination unreachable with the given code
    Unreachable { code: u8 },
    /// Any other ICMP error quoting our probe
    Other { icmp_type: u8, code: u8 },
}

impl ReplyKind {
    /// True when the reply came from the target itself
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::EchoReply => true,
            Self::Unreachable { code } => {
                *code == ICMP_CODE_PROTOCOL_UNREACHABLE || *code == ICMP_CODE_PORT_UNREACHABLE
            }
            Self::TimeExceeded | Self::Other { .. } => false,
        }
    }
}

impl fmt::Display for ReplyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EchoReply => f.write_str("echo reply"),
            Self::TimeExceeded => f.write_str("time exceeded"),
            Self::Unreachable { code } => write!(f, "unreachable (code {})", code),
            Self::Other { icmp_type, code } => write!(f, "icmp type {}, code {}", icmp_type, code),
        }
    }
}

/// A reply matched to an outstanding probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub ttl: u8,
    pub responder: Ipv4Addr,
    #[serde(rename = "elapsed_ms", with = "millis_serde")]
    pub elapsed: Duration,
    pub via: ProbeProtocol,
    pub kind: ReplyKind,
    /// Set when this reply ends a path-discovery trace
    pub complete: bool,
}

impl ProbeResult {
    /// Elapsed time in whole milliseconds, saturating
    pub fn elapsed_ms(&self) -> u32 {
        u32::try_from(self.elapsed.as_millis()).unwrap_or(u32::MAX)
    }

    pub fn via_udp(&self) -> bool {
        self.via == ProbeProtocol::Udp
    }
}

/// Progress event handed to the reporter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum TraceEvent {
    /// No matching reply within the budget for one attempt
    Timeout { ttl: u8 },
    Reply(ProbeResult),
}

impl TraceEvent {
    pub fn ttl(&self) -> u8 {
        match self {
            Self::Timeout { ttl } => *ttl,
            Self::Reply(result) => result.ttl,
        }
    }
}

/// Per-TTL aggregate built from events
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HopStats {
    pub ttl: u8,
    pub responder: Option<Ipv4Addr>,
    pub replies: u64,
    pub timeouts: u64,
    #[serde(with = "millis_serde")]
    pub min_rtt: Duration,
    #[serde(with = "millis_serde")]
    pub max_rtt: Duration,
    /// Running mean in microseconds (Welford)
    pub mean_rtt: f64,
    pub m2: f64,
}

impl HopStats {
    pub fn new(ttl: u8) -> Self {
        Self {
            ttl,
            min_rtt: Duration::MAX,
            ..Self::default()
        }
    }

    pub fn record_reply(&mut self, responder: Ipv4Addr, rtt: Duration) {
        self.replies += 1;
        self.responder = Some(responder);

        if rtt < self.min_rtt {
            self.min_rtt = rtt;
        }
        if rtt > self.max_rtt {
            self.max_rtt = rtt;
        }

        let rtt_micros = rtt.as_micros() as f64;
        let delta = rtt_micros - self.mean_rtt;
        self.mean_rtt += delta / self.replies as f64;
        let delta2 = rtt_micros - self.mean_rtt;
        self.m2 += delta * delta2;
    }

    pub fn record_timeout(&mut self) {
        self.timeouts += 1;
    }

    pub fn attempts(&self) -> u64 {
        self.replies + self.timeouts
    }

    pub fn loss_pct(&self) -> f64 {
        let attempts = self.attempts();
        if attempts == 0 {
            0.0
        } else {
            self.timeouts as f64 / attempts as f64 * 100.0
        }
    }

    pub fn avg_rtt(&self) -> Duration {
        Duration::from_micros(self.mean_rtt as u64)
    }

    pub fn stddev(&self) -> Duration {
        if self.replies < 2 {
            return Duration::ZERO;
        }
        let variance = self.m2 / self.replies as f64;
        Duration::from_micros(variance.sqrt() as u64)
    }
}

/// Record of a whole run, for export and replay
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceLog {
    pub session: TraceSession,
    pub started_at: DateTime<Utc>,
    pub events: Vec<TraceEvent>,
    pub hops: BTreeMap<u8, HopStats>,
    /// Destination reached?
    pub complete: bool,
}

impl TraceLog {
    pub fn new(session: TraceSession) -> Self {
        Self {
            session,
            started_at: Utc::now(),
            events: Vec::new(),
            hops: BTreeMap::new(),
            complete: false,
        }
    }

    pub fn record(&mut self, event: &TraceEvent) {
        let hop = self
            .hops
            .entry(event.ttl())
            .or_insert_with(|| HopStats::new(event.ttl()));

        match event {
            TraceEvent::Timeout { .. } => hop.record_timeout(),
            TraceEvent::Reply(result) => {
                hop.record_reply(result.responder, result.elapsed);
                self.complete |= result.complete;
            }
        }

        self.events.push(*event);
    }

    pub fn replies(&self) -> impl Iterator<Item = &ProbeResult> {
        self.events.iter().filter_map(|event| match event {
            TraceEvent::Reply(result) => Some(result),
            TraceEvent::Timeout { .. } => None,
        })
    }

    pub fn last_reply(&self) -> Option<&ProbeResult> {
        self.replies().last()
    }

    pub fn hop(&self, ttl: u8) -> Option<&HopStats> {
        self.hops.get(&ttl)
    }
}

/// Serde helper for Duration as fractional milliseconds (`Duration::MAX` as null)
mod millis_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = (*duration != Duration::MAX).then(|| duration.as_micros() as f64 / 1000.0);
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<f64>::deserialize(deserializer)? {
            Some(millis) => {
                Duration::try_from_secs_f64(millis / 1000.0).map_err(serde::de::Error::custom)
            }
            None => Ok(Duration::MAX),
        }
    }
}
