//! Engine configuration (`_cursorflow/config.toml`).

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Top-level engine configuration, loaded from TOML with defaults for
/// anything absent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    pub max_concurrent_lanes: u32,
    pub default_task_timeout_secs: u64,
    pub idle_warn_secs: u64,
    pub idle_escalate_secs: u64,
    pub idle_kill_secs: u64,
    pub heartbeat_secs: u64,
    pub output_limit_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_lanes: 4,
            default_task_timeout_secs: 600,
            idle_warn_secs: 60,
            idle_escalate_secs: 120,
            idle_kill_secs: 600,
            heartbeat_secs: 30,
            output_limit_bytes: 2 * 1024 * 1024,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_lanes == 0 {
            return Err(anyhow!("max_concurrent_lanes must be > 0"));
        }
        if self.idle_warn_secs >= self.idle_escalate_secs {
            return Err(anyhow!("idle_warn_secs must be < idle_escalate_secs"));
        }
        if self.idle_escalate_secs >= self.idle_kill_secs {
            return Err(anyhow!("idle_escalate_secs must be < idle_kill_secs"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        return Ok(EngineConfig::default());
    }
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let config: EngineConfig = toml::from_str(&raw).with_context(|| format!("parse {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

pub fn write_config(path: &Path, config: &EngineConfig) -> Result<()> {
    config.validate()?;
    let contents = toml::to_string_pretty(config).context("serialize config")?;
    write_atomic(path, &contents)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents).with_context(|| format!("write temp {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
