use serde::{Deserialize, Serialize};
use std::ops::ControlFlow;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use crate::config::TraceConfig;
use crate::error::{TraceError, TraceResult};
use crate::probe::{
    ICMP_HEADER_SIZE, IPV4_HEADER_SIZE, MatchedReply, ProbeKey, ProbeSender, ReplyReceiver,
    build_icmp_probe, build_udp_probe, correlate_reply, is_timeout,
};
use crate::state::{
    Probe, ProbeProtocol, ProbeResult, ProtocolSet, TraceEvent, TraceMode, TraceSession,
};
use crate::trace::report::Reporter;

/// Room for the reply IP and ICMP headers plus the quoted datagram
const RECEIVE_BUFFER_SIZE: usize = IPV4_HEADER_SIZE + ICMP_HEADER_SIZE + 1024;

/// What a finished run looked like
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceSummary {
    /// Datagrams written (a UDP+ICMP attempt counts two)
    pub probes_sent: u32,
    /// Received packets that matched no outstanding probe
    pub bad_packets: u32,
    /// A terminal reply was seen
    pub complete: bool,
    /// The reporter stopped the run
    pub cancelled: bool,
    pub udp_enabled: bool,
    pub icmp_enabled: bool,
}

/// Outcome of waiting on one attempt
enum Wait {
    Matched(MatchedReply, Duration),
    TimedOut,
}

/// Sends probes and matches replies, one probe in flight at a time.
///
/// All I/O is blocking and happens on the calling thread. The caller owns the
/// sockets (or whatever implements the two traits) and decides when to stop
/// through the [`Reporter`].
pub struct TraceEngine<S, R> {
    session: TraceSession,
    config: TraceConfig,
    sender: S,
    receiver: R,
    protocols: ProtocolSet,
    next_sequence: u16,
    consecutive_bad: u32,
    summary: TraceSummary,
    buffer: Vec<u8>,
}

impl<S: ProbeSender, R: ReplyReceiver> TraceEngine<S, R> {
    pub fn new(session: TraceSession, config: TraceConfig, sender: S, receiver: R) -> Self {
        Self {
            session,
            config,
            sender,
            receiver,
            protocols: ProtocolSet::BOTH,
            next_sequence: 0,
            consecutive_bad: 0,
            summary: TraceSummary::default(),
            buffer: vec![0u8; RECEIVE_BUFFER_SIZE],
        }
    }

    /// Restrict the transports probed from the start (both by default)
    pub fn with_protocols(mut self, protocols: ProtocolSet) -> Self {
        self.protocols = protocols;
        self
    }

    /// Run to completion, cancellation or a fatal error
    pub fn run<P: Reporter + ?Sized>(mut self, reporter: &mut P) -> TraceResult<TraceSummary> {
        self.config.validate()?;
        if self.protocols.is_empty() {
            return Err(TraceError::NoProtocol);
        }

        debug!(
            trace_id = self.session.trace_id,
            source = %self.session.source,
            target = %self.session.target,
            mode = ?self.session.mode,
            "starting trace"
        );

        let flow = match self.session.mode {
            TraceMode::PathDiscovery => self.discover_path(reporter)?,
            TraceMode::Ping => self.ping(reporter)?,
        };

        self.summary.cancelled = flow.is_break();
        self.summary.udp_enabled = self.protocols.udp;
        self.summary.icmp_enabled = self.protocols.icmp;

        debug!(summary = ?self.summary, "trace finished");
        Ok(self.summary)
    }

    fn discover_path<P: Reporter + ?Sized>(
        &mut self,
        reporter: &mut P,
    ) -> TraceResult<ControlFlow<()>> {
        for ttl in 1..=self.config.max_ttl {
            if self.probe_hop(ttl, reporter)?.is_break() {
                return Ok(ControlFlow::Break(()));
            }
            if self.summary.complete {
                break;
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    fn ping<P: Reporter + ?Sized>(&mut self, reporter: &mut P) -> TraceResult<ControlFlow<()>> {
        let ttl = self.config.max_ttl;
        loop {
            if self.probe_hop(ttl, reporter)?.is_break() {
                return Ok(ControlFlow::Break(()));
            }
            if !self.config.ping_interval.is_zero() {
                std::thread::sleep(self.config.ping_interval);
            }
        }
    }

    /// Up to `attempts_per_hop` attempts at one TTL; stops at the first match
    fn probe_hop<P: Reporter + ?Sized>(
        &mut self,
        ttl: u8,
        reporter: &mut P,
    ) -> TraceResult<ControlFlow<()>> {
        for _ in 0..self.config.attempts_per_hop {
            let probe = self.send_probes(ttl)?;

            match self.await_reply(&probe)? {
                Wait::TimedOut => {
                    self.consecutive_bad = 0;
                    debug!(ttl, sequence = probe.sequence, "probe timed out");
                    if reporter.report(&TraceEvent::Timeout { ttl }).is_break() {
                        return Ok(ControlFlow::Break(()));
                    }
                }
                Wait::Matched(reply, elapsed) => {
                    self.consecutive_bad = 0;
                    let complete = reply.kind.is_terminal();
                    self.summary.complete |= complete;

                    if self.session.is_ping() {
                        self.protocols.narrow_to(reply.via);
                    }

                    let result = ProbeResult {
                        ttl,
                        responder: reply.responder,
                        elapsed,
                        via: reply.via,
                        kind: reply.kind,
                        complete,
                    };
                    debug!(
                        ttl,
                        sequence = probe.sequence,
                        responder = %result.responder,
                        via = %result.via,
                        kind = ?result.kind,
                        elapsed_us = elapsed.as_micros() as u64,
                        "matched reply"
                    );

                    return Ok(reporter.report(&TraceEvent::Reply(result)));
                }
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    /// Send one attempt on every enabled transport
    fn send_probes(&mut self, ttl: u8) -> TraceResult<Probe> {
        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);

        let key = self.key(sequence);
        let TraceSession {
            trace_id,
            source,
            target,
            ..
        } = self.session;

        if self.protocols.udp {
            let packet = build_udp_probe(
                trace_id,
                ttl,
                source,
                target,
                self.config.base_port,
                key.wire_value(),
            );
            self.send(ProbeProtocol::Udp, &packet)?;
        }

        if self.protocols.icmp {
            let packet = build_icmp_probe(trace_id, ttl, source, target, key.wire_value());
            self.send(ProbeProtocol::Icmp, &packet)?;
        }

        trace!(ttl, sequence, protocols = ?self.protocols, "probe sent");

        Ok(Probe {
            ttl,
            sequence,
            protocols: self.protocols,
            sent_at: Instant::now(),
        })
    }

    fn send(&mut self, protocol: ProbeProtocol, packet: &[u8]) -> TraceResult<()> {
        let sent = self
            .sender
            .send_probe(packet, self.session.target)
            .map_err(TraceError::socket("sendto"))?;

        if sent != packet.len() {
            return Err(TraceError::IncompleteSend {
                protocol,
                sent,
                expected: packet.len(),
            });
        }

        self.summary.probes_sent += 1;
        Ok(())
    }

    /// Read replies until one matches `probe` or its budget runs out
    fn await_reply(&mut self, probe: &Probe) -> TraceResult<Wait> {
        let key = self.key(probe.sequence);

        loop {
            let remaining = self
                .config
                .probe_timeout
                .saturating_sub(probe.sent_at.elapsed());
            if remaining.is_zero() {
                return Ok(Wait::TimedOut);
            }

            self.receiver
                .set_receive_timeout(remaining)
                .map_err(TraceError::socket("setsockopt(SO_RCVTIMEO)"))?;

            let (len, from) = match self.receiver.receive(&mut self.buffer) {
                Ok(received) => received,
                Err(e) if is_timeout(&e) => return Ok(Wait::TimedOut),
                Err(e) => return Err(TraceError::socket("recvfrom")(e)),
            };

            match correlate_reply(&self.buffer[..len], from, &key) {
                Ok(reply) => return Ok(Wait::Matched(reply, probe.sent_at.elapsed())),
                Err(rejection) => {
                    trace!(%from, len, %rejection, "ignoring packet");
                    self.count_bad_packet()?;
                }
            }
        }
    }

    fn count_bad_packet(&mut self) -> TraceResult<()> {
        self.consecutive_bad += 1;
        self.summary.bad_packets += 1;

        if self.session.is_ping() && self.consecutive_bad > self.config.bad_packet_ceiling {
            warn!(
                count = self.consecutive_bad,
                ceiling = self.config.bad_packet_ceiling,
                "giving up on ping: too many consecutive bad packets"
            );
            return Err(TraceError::TooManyBadPackets {
                count: self.consecutive_bad,
            });
        }
        Ok(())
    }

    fn key(&self, sequence: u16) -> ProbeKey {
        ProbeKey {
            trace_id: self.session.trace_id,
            base_port: self.config.base_port,
            sequence,
        }
    }
}

/// Run one trace with the given sockets and reporter
pub fn trace_route<S, R, P>(
    session: TraceSession,
    config: TraceConfig,
    sender: S,
    receiver: R,
    reporter: &mut P,
) -> TraceResult<TraceSummary>
where
    S: ProbeSender,
    R: ReplyReceiver,
    P: Reporter + ?Sized,
{
    TraceEngine::new(session, config, sender, receiver).run(reporter)
}
