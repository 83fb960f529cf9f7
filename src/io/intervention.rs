//! C8: out-of-band user messages and timeout overrides for a running lane.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};

const INTERVENTION_FILE: &str = "intervention.txt";
const TIMEOUT_FILE: &str = "timeout.txt";

/// Write a message for delivery to a running (or not-yet-running) lane.
/// Consumed by the Agent Runner before its next turn.
pub fn write_intervention(lane_path: &Path, message: &str) -> Result<()> {
    fs::create_dir_all(lane_path)
        .with_context(|| format!("create lane dir {}", lane_path.display()))?;
    fs::write(lane_path.join(INTERVENTION_FILE), message)
        .with_context(|| format!("write intervention in {}", lane_path.display()))
}

/// Read and atomically consume a pending intervention, if any. Consumption
/// renames the file to `.consumed.<ts>` rather than deleting it, preserving
/// the record.
pub fn read_and_consume_intervention(lane_path: &Path) -> Result<Option<String>> {
    let path = lane_path.join(INTERVENTION_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(&path)
        .with_context(|| format!("read {}", path.display()))?;
    let ts = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let consumed_path = lane_path.join(format!(".consumed.{ts}"));
    fs::rename(&path, &consumed_path)
        .with_context(|| format!("consume {}", path.display()))?;
    Ok(Some(content))
}

/// Write a new default timeout (milliseconds) for subsequent task
/// invocations on a lane. Does not affect a task already in flight unless
/// cancellation is separately requested.
pub fn write_timeout_override(lane_path: &Path, timeout_ms: u64) -> Result<()> {
    fs::create_dir_all(lane_path)
        .with_context(|| format!("create lane dir {}", lane_path.display()))?;
    fs::write(lane_path.join(TIMEOUT_FILE), timeout_ms.to_string())
        .with_context(|| format!("write timeout override in {}", lane_path.display()))
}

/// Read a pending timeout override, if present and parseable.
pub fn read_timeout_override(lane_path: &Path) -> Result<Option<Duration>> {
    let path = lane_path.join(TIMEOUT_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    let ms: u64 = content
        .trim()
        .parse()
        .with_context(|| format!("parse timeout override in {}", path.display()))?;
    Ok(Some(Duration::from_millis(ms)))
}
