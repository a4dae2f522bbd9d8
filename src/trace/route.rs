//! Route discovery and target pinging on top of the engine.

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::ops::ControlFlow;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::TraceConfig;
use crate::error::TraceResult;
use crate::probe::{ProbeSender, ReplyReceiver};
use crate::state::{TraceEvent, TraceMode, TraceSession};
use crate::trace::engine::trace_route;
use crate::trace::report::Reporter;

/// A router or target that answered a probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteNode {
    /// TTL of the probe that reached it
    pub distance: u8,
    pub address: Ipv4Addr,
    pub rtt: Duration,
}

/// Observer for route and ping runs. Returning `false` stops the run.
pub trait RouteListener {
    fn found_node(&mut self, node: &RouteNode) -> bool;

    fn timeout(&mut self, distance: u8) -> bool;
}

/// Which run a collector is attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CollectMode {
    /// Keep every node, run on without a listener
    Route,
    /// Keep the latest node, stop after one event without a listener
    Ping,
}

/// Reporter that turns engine events into [`RouteNode`]s.
///
/// Stops the run once the listener declines or `max_duration` has elapsed
/// since the collector was created.
pub struct RouteCollector<'l> {
    mode: CollectMode,
    listener: Option<&'l mut dyn RouteListener>,
    deadline: Option<Instant>,
    nodes: Vec<RouteNode>,
}

impl<'l> RouteCollector<'l> {
    pub fn for_route(
        listener: Option<&'l mut dyn RouteListener>,
        max_duration: Option<Duration>,
    ) -> Self {
        Self::new(CollectMode::Route, listener, max_duration)
    }

    pub fn for_ping(
        listener: Option<&'l mut dyn RouteListener>,
        max_duration: Option<Duration>,
    ) -> Self {
        Self::new(CollectMode::Ping, listener, max_duration)
    }

    fn new(
        mode: CollectMode,
        listener: Option<&'l mut dyn RouteListener>,
        max_duration: Option<Duration>,
    ) -> Self {
        Self {
            mode,
            listener,
            deadline: max_duration.map(|d| Instant::now() + d),
            nodes: Vec::new(),
        }
    }

    pub fn nodes(&self) -> &[RouteNode] {
        &self.nodes
    }

    pub fn into_nodes(self) -> Vec<RouteNode> {
        self.nodes
    }

    /// Most recent node seen
    pub fn last_node(&self) -> Option<&RouteNode> {
        self.nodes.last()
    }

    fn expired(&self) -> bool {
        self.deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
    }
}

impl Reporter for RouteCollector<'_> {
    fn report(&mut self, event: &TraceEvent) -> ControlFlow<()> {
        let node = match event {
            TraceEvent::Reply(result) => {
                let node = RouteNode {
                    distance: result.ttl,
                    address: result.responder,
                    rtt: result.elapsed,
                };
                if self.mode == CollectMode::Ping {
                    self.nodes.clear();
                }
                self.nodes.push(node);
                Some(node)
            }
            TraceEvent::Timeout { .. } => None,
        };

        let keep_going = match self.listener.as_deref_mut() {
            None => self.mode == CollectMode::Route,
            Some(listener) => match node {
                Some(node) => listener.found_node(&node),
                None => listener.timeout(event.ttl()),
            },
        };

        if keep_going && !self.expired() {
            ControlFlow::Continue(())
        } else {
            ControlFlow::Break(())
        }
    }
}

/// Where to trace from and to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteRequest {
    pub trace_id: u16,
    pub source: Ipv4Addr,
    pub target: Ipv4Addr,
    /// Overall limit for the run, unlimited when `None`
    pub max_duration: Option<Duration>,
}

impl RouteRequest {
    fn session(&self, mode: TraceMode) -> TraceSession {
        TraceSession::new(self.trace_id, self.source, self.target, mode)
    }
}

/// Discover the path to the target, returning every node that answered
pub fn get_route<S: ProbeSender, R: ReplyReceiver>(
    request: &RouteRequest,
    config: TraceConfig,
    sender: S,
    receiver: R,
    listener: Option<&mut dyn RouteListener>,
) -> TraceResult<Vec<RouteNode>> {
    let mut collector = RouteCollector::for_route(listener, request.max_duration);
    let summary = trace_route(
        request.session(TraceMode::PathDiscovery),
        config,
        sender,
        receiver,
        &mut collector,
    )?;

    debug!(
        target = %request.target,
        nodes = collector.nodes().len(),
        complete = summary.complete,
        "route collected"
    );
    Ok(collector.into_nodes())
}

/// Ping the target at a fixed TTL, returning the last node that answered
pub fn ping_target<S: ProbeSender, R: ReplyReceiver>(
    request: &RouteRequest,
    config: TraceConfig,
    sender: S,
    receiver: R,
    listener: Option<&mut dyn RouteListener>,
) -> TraceResult<Option<RouteNode>> {
    let mut collector = RouteCollector::for_ping(listener, request.max_duration);
    trace_route(
        request.session(TraceMode::Ping),
        config,
        sender,
        receiver,
        &mut collector,
    )?;

    Ok(collector.last_node().copied())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{ProbeProtocol, ProbeResult, ReplyKind};

    fn reply(ttl: u8, last_octet: u8) -> TraceEvent {
        TraceEvent::Reply(ProbeResult {
            ttl,
            responder: Ipv4Addr::new(10, 0, 0, last_octet),
            elapsed: Duration::from_millis(u64::from(ttl) * 3),
            via: ProbeProtocol::Udp,
            kind: ReplyKind::TimeExceeded,
            complete: false,
        })
    }

    /// Records calls and answers `false` after `limit` of them
    struct Limited {
        calls: Vec<String>,
        limit: usize,
    }

    impl RouteListener for Limited {
        fn found_node(&mut self, node: &RouteNode) -> bool {
            self.calls.push(format!("node {} {}", node.distance, node.address));
            self.calls.len() < self.limit
        }

        fn timeout(&mut self, distance: u8) -> bool {
            self.calls.push(format!("timeout {}", distance));
            self.calls.len() < self.limit
        }
    }

    #[test]
    fn test_route_without_listener_keeps_going() {
        let mut collector = RouteCollector::for_route(None, None);
        assert!(collector.report(&reply(1, 1)).is_continue());
        assert!(collector.report(&TraceEvent::Timeout { ttl: 2 }).is_continue());
        assert!(collector.report(&reply(3, 3)).is_continue());

        let nodes = collector.into_nodes();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[1].distance, 3);
        assert_eq!(nodes[1].rtt, Duration::from_millis(9));
    }

    #[test]
    fn test_ping_without_listener_stops_after_first_event() {
        let mut collector = RouteCollector::for_ping(None, None);
        assert!(collector.report(&TraceEvent::Timeout { ttl: 32 }).is_break());
        assert!(collector.last_node().is_none());

        let mut collector = RouteCollector::for_ping(None, None);
        assert!(collector.report(&reply(32, 9)).is_break());
        assert_eq!(collector.last_node().unwrap().address, Ipv4Addr::new(10, 0, 0, 9));
    }

    #[test]
    fn test_ping_keeps_latest_node() {
        let mut listener = Limited {
            calls: Vec::new(),
            limit: 10,
        };
        let mut collector = RouteCollector::for_ping(Some(&mut listener), None);
        collector.report(&reply(32, 1));
        collector.report(&reply(32, 2));

        assert_eq!(collector.nodes().len(), 1);
        assert_eq!(collector.last_node().unwrap().address, Ipv4Addr::new(10, 0, 0, 2));
    }

    #[test]
    fn test_listener_decides() {
        let mut listener = Limited {
            calls: Vec::new(),
            limit: 3,
        };
        {
            let mut collector = RouteCollector::for_route(Some(&mut listener), None);
            assert!(collector.report(&reply(1, 1)).is_continue());
            assert!(collector.report(&TraceEvent::Timeout { ttl: 2 }).is_continue());
            assert!(collector.report(&reply(3, 3)).is_break());
        }
        assert_eq!(
            listener.calls,
            vec!["node 1 10.0.0.1", "timeout 2", "node 3 10.0.0.3"]
        );
    }

    #[test]
    fn test_deadline_stops_run() {
        let mut collector = RouteCollector::for_route(None, Some(Duration::ZERO));
        assert!(collector.report(&reply(1, 1)).is_break());
        // The node is still recorded
        assert_eq!(collector.nodes().len(), 1);
    }
}
