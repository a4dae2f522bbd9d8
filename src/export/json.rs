use anyhow::{Context, Result};
use std::io::{Read, Write};

use crate::state::TraceLog;

/// Export a trace log as pretty-printed JSON
pub fn export_json<W: Write>(log: &TraceLog, mut writer: W) -> Result<()> {
    serde_json::to_writer_pretty(&mut writer, log).context("Failed to serialize trace log")?;
    writeln!(writer)?;
    Ok(())
}

/// Load a trace log previously written by [`export_json`]
pub fn load_json<R: Read>(reader: R) -> Result<TraceLog> {
    serde_json::from_reader(reader).context("Failed to parse trace log")
}
