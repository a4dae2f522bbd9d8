use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{TraceError, TraceResult};

/// Reply budget for one probe attempt, measured from the send
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(5000);
/// Offset added to the probe sequence to form the UDP destination port / ICMP sequence
pub const TRACE_ROUTE_BASE_PORT: u16 = 48132;
/// Highest TTL probed in path-discovery mode, and the fixed TTL in ping mode
pub const MAX_TTL: u8 = 32;
/// Probe attempts per hop before moving on
pub const MAX_PROBE_ATTEMPTS: u8 = 3;
/// Consecutive unmatched packets tolerated in ping mode
pub const MAX_CONSECUTIVE_BAD_PACKETS: u32 = 256;

/// Engine tuning. `Default` gives the well-known constants above.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceConfig {
    /// Reply budget per attempt
    #[serde(with = "duration_serde")]
    pub probe_timeout: Duration,
    /// Maximum TTL (path discovery) / fixed TTL (ping)
    pub max_ttl: u8,
    /// Attempts per hop
    pub attempts_per_hop: u8,
    /// Correlation base for ports and ICMP sequences
    pub base_port: u16,
    /// Ping-mode consecutive bad packet ceiling
    pub bad_packet_ceiling: u32,
    /// Pause between ping rounds
    #[serde(with = "duration_serde")]
    pub ping_interval: Duration,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            probe_timeout: PROBE_TIMEOUT,
            max_ttl: MAX_TTL,
            attempts_per_hop: MAX_PROBE_ATTEMPTS,
            base_port: TRACE_ROUTE_BASE_PORT,
            bad_packet_ceiling: MAX_CONSECUTIVE_BAD_PACKETS,
            ping_interval: Duration::ZERO,
        }
    }
}

impl TraceConfig {
    /// Validate settings before a run
    pub fn validate(&self) -> TraceResult<()> {
        if self.probe_timeout.is_zero() {
            return Err(TraceError::InvalidConfig("probe timeout must be positive".into()));
        }

        if self.max_ttl == 0 || self.max_ttl > MAX_TTL {
            return Err(TraceError::InvalidConfig(format!(
                "max TTL must be between 1 and {}",
                MAX_TTL
            )));
        }

        if self.attempts_per_hop == 0 {
            return Err(TraceError::InvalidConfig(
                "at least one attempt per hop is required".into(),
            ));
        }

        Ok(())
    }
}

/// Serde helper for Duration
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
