use anyhow::{Context, Result};
use clap::Parser;
use std::fs::File;
use std::io::BufReader;
use std::net::{IpAddr, Ipv4Addr, ToSocketAddrs};
use std::ops::ControlFlow;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

mod cli;

use cli::Args;
use rawtrace::config::TraceConfig;
use rawtrace::export::{export_csv, export_events_csv, export_json, generate_report, load_json};
use rawtrace::probe::{TraceSockets, check_permissions, detect_source_ip};
use rawtrace::state::{ProtocolSet, TraceEvent, TraceLog, TraceSession};
use rawtrace::trace::{ReportLine, TraceEngine, TraceSummary};
use rawtrace::{TraceError, TraceResult};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Validate arguments
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    init_tracing(args.verbose);

    // Handle replay mode (doesn't need permissions or target resolution)
    if let Some(ref replay_path) = args.replay {
        return run_replay_mode(&args, replay_path);
    }

    // Check permissions early
    if let Err(e) = check_permissions() {
        eprintln!("{}", e);
        std::process::exit(1);
    }

    let target_str = args.target.clone().context("No target specified")?;
    let target = resolve_target(&target_str)
        .with_context(|| format!("Failed to resolve target: {}", target_str))?;

    let source = match args.source {
        Some(source) => source,
        None => detect_source_ip(target)
            .with_context(|| format!("Failed to find a source address for {}", target))?,
    };

    let config = args.trace_config();
    config.validate()?;

    let trace_id = args.trace_id.unwrap_or_else(default_trace_id);
    let session = TraceSession::new(trace_id, source, target, args.mode());
    debug!(?session, ?config, "resolved trace parameters");

    // Cancellation token for graceful shutdown
    let cancel = CancellationToken::new();

    // Setup Ctrl+C handler
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        cancel_clone.cancel();
    });

    let sockets = TraceSockets::open(source, config.probe_timeout)
        .context("Failed to open raw sockets")?;

    if !args.is_batch_mode() {
        println!(
            "rawtrace to {} ({}) from {}, {} hops max",
            target_str, target, source, config.max_ttl
        );
    }

    let run = TraceRun {
        session,
        config,
        protocols: args.protocols(),
        count: args.count,
        stream: !args.is_batch_mode(),
        raw: args.raw,
        cancel,
    };
    let (log, result) = tokio::task::spawn_blocking(move || run.execute(sockets))
        .await
        .context("Trace task panicked")?;

    let summary = match result {
        Ok(summary) => summary,
        Err(e) => {
            // Keep whatever was collected before the failure
            if args.is_batch_mode() && !log.events.is_empty() {
                write_output(&args, &log)?;
            }
            return Err(describe_error(e));
        }
    };

    debug!(?summary, "trace complete");
    if args.is_batch_mode() {
        write_output(&args, &log)?;
    } else {
        print_summary(&log, &summary);
    }

    Ok(())
}

/// Everything the blocking trace thread needs
struct TraceRun {
    session: TraceSession,
    config: TraceConfig,
    protocols: ProtocolSet,
    count: u64,
    stream: bool,
    raw: bool,
    cancel: CancellationToken,
}

impl TraceRun {
    /// Run the engine on the current (blocking) thread, recording every event
    fn execute(self, mut sockets: TraceSockets) -> (TraceLog, TraceResult<TraceSummary>) {
        let mut log = TraceLog::new(self.session);
        let mut seen: u64 = 0;

        let (sender, receiver) = sockets.split();
        let engine = TraceEngine::new(self.session, self.config, sender, receiver)
            .with_protocols(self.protocols);

        let result = engine.run(&mut |event: &TraceEvent| {
            log.record(event);
            seen += 1;

            if self.stream {
                if self.raw {
                    println!("{}", ReportLine::from(event));
                } else {
                    print_event(event);
                }
            }

            let count_reached = self.count > 0 && seen >= self.count;
            if self.cancel.is_cancelled() || count_reached {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });

        (log, result)
    }
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("rawtrace={}", default_level)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Trace identifier for this process when none is given
fn default_trace_id() -> u16 {
    (std::process::id() & 0xFFFF) as u16
}

/// Resolve target to an IPv4 address
fn resolve_target(target: &str) -> Result<Ipv4Addr> {
    // Try parsing as IP address first
    if let Ok(ip) = target.parse::<IpAddr>() {
        return match ip {
            IpAddr::V4(v4) => Ok(v4),
            IpAddr::V6(_) => anyhow::bail!("IPv6 targets are not supported"),
        };
    }

    // Resolve hostname
    format!("{}:0", target)
        .to_socket_addrs()?
        .find_map(|addr| match addr.ip() {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
        .context("No IPv4 addresses found for hostname")
}

/// Load a trace log from a JSON file
fn load_log(path: &str) -> Result<TraceLog> {
    const MAX_REPLAY_SIZE: u64 = 10 * 1024 * 1024; // 10MB

    let file = File::open(path).with_context(|| format!("Failed to open replay file: {}", path))?;

    let metadata = file
        .metadata()
        .with_context(|| format!("Failed to read replay file metadata: {}", path))?;
    if metadata.len() > MAX_REPLAY_SIZE {
        anyhow::bail!("Replay file too large (max 10MB): {}", path);
    }

    load_json(BufReader::new(file)).with_context(|| format!("Failed to load replay file: {}", path))
}

/// Run replay mode - load a saved trace log and display/export it
fn run_replay_mode(args: &Args, replay_path: &str) -> Result<()> {
    let log = load_log(replay_path)?;

    if args.is_batch_mode() {
        return write_output(args, &log);
    }

    for event in &log.events {
        if args.raw {
            println!("{}", ReportLine::from(event));
        } else {
            print_event(event);
        }
    }
    Ok(())
}

fn write_output(args: &Args, log: &TraceLog) -> Result<()> {
    let stdout = std::io::stdout();
    if args.json {
        export_json(log, stdout.lock())?;
    } else if args.csv && args.events {
        export_events_csv(log, stdout.lock())?;
    } else if args.csv {
        export_csv(log, stdout.lock())?;
    } else if args.report {
        generate_report(log, stdout.lock())?;
    }
    Ok(())
}

fn print_event(event: &TraceEvent) {
    match event {
        TraceEvent::Timeout { ttl } => println!("{:>3}  *", ttl),
        TraceEvent::Reply(result) => println!(
            "{:>3}  {:<15}  {:>8.2}ms  {:<4} {}",
            result.ttl,
            result.responder,
            result.elapsed.as_secs_f64() * 1000.0,
            result.via,
            result.kind
        ),
    }
}

fn print_summary(log: &TraceLog, summary: &TraceSummary) {
    if summary.cancelled {
        println!("Stopped after {} events", log.events.len());
    } else if summary.complete {
        let hops = log.last_reply().map(|r| r.ttl).unwrap_or_default();
        println!("Reached {} in {} hops", log.session.target, hops);
    } else if !log.session.is_ping() {
        println!("Destination not reached");
    }

    if summary.bad_packets > 0 {
        warn!(count = summary.bad_packets, "ignored unrelated packets");
    }
}

/// Add hints for errors a user can act on
fn describe_error(err: TraceError) -> anyhow::Error {
    let hint = match &err {
        TraceError::TooManyBadPackets { .. } => {
            Some("another program may be flooding ICMP; try a different --trace-id")
        }
        TraceError::Socket { .. } if err.os_error_code() == Some(1) => {
            Some("raw sockets need root or CAP_NET_RAW")
        }
        _ => None,
    };

    match hint {
        Some(hint) => anyhow::anyhow!("{}\nHint: {}", err, hint),
        None => anyhow::Error::new(err),
    }
}
