use std::io::Write;

use crate::state::{TraceLog, TraceMode};

fn format_ms(value: std::time::Duration) -> String {
    format!("{:.1}ms", value.as_secs_f64() * 1000.0)
}

/// Generate a text report similar to mtr --report
pub fn generate_report<W: Write>(log: &TraceLog, mut writer: W) -> std::io::Result<()> {
    let session = &log.session;
    let mode = match session.mode {
        TraceMode::PathDiscovery => "traceroute",
        TraceMode::Ping => "ping",
    };
    writeln!(
        writer,
        "rawtrace {} report for {} from {} (trace id {:#06x})",
        mode, session.target, session.source, session.trace_id
    )?;
    writeln!(writer, "Started: {}", log.started_at.format("%Y-%m-%d %H:%M:%S UTC"))?;
    writeln!(writer)?;

    writeln!(
        writer,
        "{:>3}  {:<20} {:>6} {:>6} {:>8} {:>8} {:>8} {:>8}",
        "#", "Host", "Loss%", "Sent", "Avg", "Min", "Max", "StdDev"
    )?;
    writeln!(writer, "{}", "-".repeat(78))?;

    // Only show hops up to the destination
    let dest_ttl = log.replies().find(|r| r.complete).map(|r| r.ttl);
    for hop in log.hops.values() {
        if hop.attempts() == 0 || dest_ttl.is_some_and(|dest| hop.ttl > dest) {
            continue;
        }

        let host = match hop.responder {
            Some(ip) => ip.to_string(),
            None => "* * *".to_string(),
        };

        let (avg, min, max, stddev) = if hop.replies > 0 {
            (
                format_ms(hop.avg_rtt()),
                format_ms(hop.min_rtt),
                format_ms(hop.max_rtt),
                format_ms(hop.stddev()),
            )
        } else {
            ("-".into(), "-".into(), "-".into(), "-".into())
        };

        writeln!(
            writer,
            "{:>3}  {:<20} {:>5.1}% {:>6} {:>8} {:>8} {:>8} {:>8}",
            hop.ttl,
            host,
            hop.loss_pct(),
            hop.attempts(),
            avg,
            min,
            max,
            stddev
        )?;
    }

    if !log.complete && session.mode == TraceMode::PathDiscovery {
        writeln!(writer)?;
        writeln!(writer, "Destination not reached")?;
    }

    Ok(())
}
