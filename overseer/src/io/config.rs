//! Orchestrator configuration stored under `.overseer/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::policy::PolicyParams;
use crate::io::workspace::IsolationMode;

/// Orchestrator configuration (TOML).
///
/// This file is intended to be edited by humans and must remain stable and
/// automatable. Missing fields default to sensible values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct OverseerConfig {
    pub session: SessionConfig,
    pub scanner: ScannerConfig,
    pub policy: PolicyConfig,
    pub workspace: WorkspaceConfig,
    pub verify: VerifyConfig,
    pub notify: NotifyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Command to start the controlled program (e.g. `["claude", "--dangerously-skip-permissions"]`).
    pub command: Vec<String>,
    /// Extra environment entries for the session.
    pub env: Vec<(String, String)>,
    /// Keepalive interval when no output has been observed.
    pub heartbeat_secs: u64,
    /// Byte written as a zero-effect keepalive.
    pub keepalive_byte: u8,
    /// No output for this long triggers an automatic interrupt.
    pub idle_timeout_secs: u64,
    /// Hard per-task ceiling; the session is terminated regardless of activity.
    pub hard_timeout_secs: u64,
    /// Grace period between drain and force-kill on close.
    pub close_grace_secs: u64,
    /// Bounded output ring buffer per session.
    pub output_buffer_bytes: usize,
    /// Bounded write queue per session; a full queue signals backpressure.
    pub write_queue_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            command: vec!["claude".to_string()],
            env: Vec::new(),
            heartbeat_secs: 180,
            keepalive_byte: 0x00,
            idle_timeout_secs: 600,
            hard_timeout_secs: 3_600,
            close_grace_secs: 5,
            output_buffer_bytes: 256 * 1024,
            write_queue_capacity: 64,
        }
    }
}

impl SessionConfig {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn hard_timeout(&self) -> Duration {
        Duration::from_secs(self.hard_timeout_secs)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_secs(self.close_grace_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScannerConfig {
    /// Rolling window capacity; must exceed the longest expected pattern.
    pub window_bytes: usize,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self { window_bytes: 8 * 1024 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PolicyConfig {
    /// `C` in the selection formula. Low favors exploitation.
    pub exploration_constant: f64,
    /// Per-level decay for reward backpropagation.
    pub reward_decay: f64,
    /// Branches at or above this average reward are terminal.
    pub quality_threshold: f64,
    /// Hard cap on decomposition depth.
    pub max_depth: u32,
    /// Hard cap on fan-out per decomposition.
    pub max_fan_out: u32,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        let params = PolicyParams::default();
        Self {
            exploration_constant: params.exploration_constant,
            reward_decay: params.reward_decay,
            quality_threshold: params.quality_threshold,
            max_depth: 3,
            max_fan_out: 8,
        }
    }
}

impl PolicyConfig {
    pub fn params(&self) -> PolicyParams {
        PolicyParams {
            exploration_constant: self.exploration_constant,
            reward_decay: self.reward_decay,
            quality_threshold: self.quality_threshold,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkspaceConfig {
    pub mode: IsolationMode,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            mode: IsolationMode::EphemeralCopy,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VerifyConfig {
    /// Check commands run in the finished workspace; each counts pass/fail.
    pub checks: Vec<Vec<String>>,
    pub check_timeout_secs: u64,
    /// Truncate check output logs beyond this many bytes.
    pub check_output_limit_bytes: usize,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            checks: Vec::new(),
            check_timeout_secs: 600,
            check_output_limit_bytes: 100_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NotifyConfig {
    /// Bounded queue per subscriber; overflow drops, never blocks.
    pub queue_capacity: usize,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self { queue_capacity: 256 }
    }
}

impl OverseerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.session.command.is_empty() || self.session.command[0].trim().is_empty() {
            return Err(anyhow!("session.command must be a non-empty array"));
        }
        if self.session.write_queue_capacity == 0 {
            return Err(anyhow!("session.write_queue_capacity must be > 0"));
        }
        if self.session.output_buffer_bytes == 0 {
            return Err(anyhow!("session.output_buffer_bytes must be > 0"));
        }
        if self.session.hard_timeout_secs == 0 {
            return Err(anyhow!("session.hard_timeout_secs must be > 0"));
        }
        if self.scanner.window_bytes == 0 {
            return Err(anyhow!("scanner.window_bytes must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.policy.reward_decay) {
            return Err(anyhow!("policy.reward_decay must be in [0, 1]"));
        }
        if self.policy.exploration_constant < 0.0 {
            return Err(anyhow!("policy.exploration_constant must be >= 0"));
        }
        if self.policy.max_fan_out == 0 {
            return Err(anyhow!("policy.max_fan_out must be > 0"));
        }
        if self.notify.queue_capacity == 0 {
            return Err(anyhow!("notify.queue_capacity must be > 0"));
        }
        for check in &self.verify.checks {
            if check.is_empty() || check[0].trim().is_empty() {
                return Err(anyhow!("verify.checks entries must be non-empty arrays"));
            }
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `OverseerConfig::default()`.
pub fn load_config(path: &Path) -> Result<OverseerConfig> {
    if !path.exists() {
        let cfg = OverseerConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: OverseerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &OverseerConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, OverseerConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let cfg = OverseerConfig::default();
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn empty_session_command_is_rejected() {
        let mut cfg = OverseerConfig::default();
        cfg.session.command = Vec::new();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn decay_outside_unit_interval_is_rejected() {
        let mut cfg = OverseerConfig::default();
        cfg.policy.reward_decay = 1.5;
        assert!(cfg.validate().is_err());
    }
}
