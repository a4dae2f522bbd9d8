//! Progress reporting from the engine to its caller.

use std::fmt;
use std::net::Ipv4Addr;
use std::ops::ControlFlow;
use std::str::FromStr;
use thiserror::Error;

use crate::state::TraceEvent;

/// Receives every timeout and matched reply as it happens.
///
/// Returning `ControlFlow::Break` stops the engine before its next send.
pub trait Reporter {
    fn report(&mut self, event: &TraceEvent) -> ControlFlow<()>;
}

impl<F> Reporter for F
where
    F: FnMut(&TraceEvent) -> ControlFlow<()>,
{
    fn report(&mut self, event: &TraceEvent) -> ControlFlow<()> {
        self(event)
    }
}

/// One line of the plain-text progress protocol.
///
/// A timeout is `"{ttl}"`; a reply is
/// `"{ttl}, {address as u32}, {elapsed_ms}, {via_udp as 0|1}"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportLine {
    Timeout {
        ttl: u8,
    },
    Reply {
        ttl: u8,
        address: Ipv4Addr,
        elapsed_ms: u32,
        via_udp: bool,
    },
}

impl From<&TraceEvent> for ReportLine {
    fn from(event: &TraceEvent) -> Self {
        match event {
            TraceEvent::Timeout { ttl } => Self::Timeout { ttl: *ttl },
            TraceEvent::Reply(result) => Self::Reply {
                ttl: result.ttl,
                address: result.responder,
                elapsed_ms: result.elapsed_ms(),
                via_udp: result.via_udp(),
            },
        }
    }
}

impl fmt::Display for ReportLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout { ttl } => write!(f, "{}", ttl),
            Self::Reply {
                ttl,
                address,
                elapsed_ms,
                via_udp,
            } => write!(
                f,
                "{}, {}, {}, {}",
                ttl,
                u32::from(*address),
                elapsed_ms,
                u8::from(*via_udp)
            ),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseReportLineError {
    #[error("expected 1 or 4 fields, found {0}")]
    FieldCount(usize),

    #[error("invalid {field}: {value:?}")]
    InvalidField { field: &'static str, value: String },
}

fn parse_field<T: FromStr>(field: &'static str, value: &str) -> Result<T, ParseReportLineError> {
    value
        .parse()
        .map_err(|_| ParseReportLineError::InvalidField {
            field,
            value: value.to_string(),
        })
}

impl FromStr for ReportLine {
    type Err = ParseReportLineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.trim().split(',').map(str::trim).collect();

        match fields.as_slice() {
            [ttl] => Ok(Self::Timeout {
                ttl: parse_field("ttl", ttl)?,
            }),
            [ttl, address, elapsed_ms, via_udp] => {
                let via_udp = match *via_udp {
                    "0" => false,
                    "1" => true,
                    other => {
                        return Err(ParseReportLineError::InvalidField {
                            field: "via_udp",
                            value: other.to_string(),
                        });
                    }
                };
                Ok(Self::Reply {
                    ttl: parse_field("ttl", ttl)?,
                    address: Ipv4Addr::from(parse_field::<u32>("address", address)?),
                    elapsed_ms: parse_field("elapsed_ms", elapsed_ms)?,
                    via_udp,
                })
            }
            other => Err(ParseReportLineError::FieldCount(other.len())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{ProbeProtocol, ProbeResult, ReplyKind};
    use std::time::Duration;

    fn reply(via: ProbeProtocol) -> TraceEvent {
        TraceEvent::Reply(ProbeResult {
            ttl: 4,
            responder: Ipv4Addr::new(10, 0, 0, 1),
            elapsed: Duration::from_micros(12_900),
            via,
            kind: ReplyKind::TimeExceeded,
            complete: false,
        })
    }

    #[test]
    fn test_timeout_line() {
        let line = ReportLine::from(&TraceEvent::Timeout { ttl: 7 });
        assert_eq!(line.to_string(), "7");
    }

    #[test]
    fn test_reply_line() {
        let line = ReportLine::from(&reply(ProbeProtocol::Udp));
        // 10.0.0.1 == 167772161
        assert_eq!(line.to_string(), "4, 167772161, 12, 1");

        let line = ReportLine::from(&reply(ProbeProtocol::Icmp));
        assert_eq!(line.to_string(), "4, 167772161, 12, 0");
    }

    #[test]
    fn test_parse_lines() {
        assert_eq!(
            "7".parse::<ReportLine>().unwrap(),
            ReportLine::Timeout { ttl: 7 }
        );
        assert_eq!(
            " 4, 167772161, 12, 1 ".parse::<ReportLine>().unwrap(),
            ReportLine::Reply {
                ttl: 4,
                address: Ipv4Addr::new(10, 0, 0, 1),
                elapsed_ms: 12,
                via_udp: true,
            }
        );
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            "1, 2".parse::<ReportLine>(),
            Err(ParseReportLineError::FieldCount(2))
        );
        assert!(matches!(
            "300".parse::<ReportLine>(),
            Err(ParseReportLineError::InvalidField { field: "ttl", .. })
        ));
        assert!(matches!(
            "1, 2, 3, yes".parse::<ReportLine>(),
            Err(ParseReportLineError::InvalidField {
                field: "via_udp",
                ..
            })
        ));
    }

    #[test]
    fn test_closure_reporter() {
        let mut seen = Vec::new();
        let mut reporter = |event: &TraceEvent| {
            seen.push(event.ttl());
            if seen.len() == 2 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        };

        assert!(reporter.report(&TraceEvent::Timeout { ttl: 1 }).is_continue());
        assert!(reporter.report(&TraceEvent::Timeout { ttl: 2 }).is_break());
        assert_eq!(seen, vec![1, 2]);
    }

    use proptest::prelude::*;

    proptest! {
        #[test]
        fn proptest_reply_line_parses_back(
            ttl in 1u8..=32,
            addr in 0u32..=u32::MAX,
            elapsed_ms in 0u32..=u32::MAX,
            via_udp in any::<bool>()
        ) {
            let line = ReportLine::Reply { ttl, address: Ipv4Addr::from(addr), elapsed_ms, via_udp };
            prop_assert_eq!(line.to_string().parse::<ReportLine>().unwrap(), line);
        }
    }
}
