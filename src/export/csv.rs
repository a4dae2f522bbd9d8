use anyhow::Result;
use std::io::Write;

use crate::state::{HopStats, TraceEvent, TraceLog};

fn millis(stats: &HopStats, value: std::time::Duration) -> String {
    if stats.replies > 0 {
        format!("{:.2}", value.as_secs_f64() * 1000.0)
    } else {
        String::new()
    }
}

/// Export per-hop statistics as CSV
pub fn export_csv<W: Write>(log: &TraceLog, mut writer: W) -> Result<()> {
    writeln!(
        writer,
        "ttl,ip,loss_pct,sent,recv,avg_ms,min_ms,max_ms,stddev_ms"
    )?;

    for hop in log.hops.values() {
        if hop.attempts() == 0 {
            continue;
        }

        let ip = hop
            .responder
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "*".to_string());

        writeln!(
            writer,
            "{},{},{:.1},{},{},{},{},{},{}",
            hop.ttl,
            ip,
            hop.loss_pct(),
            hop.attempts(),
            hop.replies,
            millis(hop, hop.avg_rtt()),
            millis(hop, hop.min_rtt),
            millis(hop, hop.max_rtt),
            millis(hop, hop.stddev()),
        )?;
    }

    Ok(())
}

/// Export the raw event stream as CSV, one row per timeout or reply
pub fn export_events_csv<W: Write>(log: &TraceLog, mut writer: W) -> Result<()> {
    writeln!(writer, "ttl,ip,elapsed_ms,via,kind,complete")?;

    for event in &log.events {
        match event {
            TraceEvent::Timeout { ttl } => writeln!(writer, "{},*,,,timeout,false", ttl)?,
            TraceEvent::Reply(result) => writeln!(
                writer,
                "{},{},{:.3},{},{},{}",
                result.ttl,
                result.responder,
                result.elapsed.as_secs_f64() * 1000.0,
                result.via,
                escape_csv(&result.kind.to_string()),
                result.complete
            )?,
        }
    }

    Ok(())
}

/// Escape a string for CSV (quote if contains comma, quote, or newline)
fn escape_csv(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}
