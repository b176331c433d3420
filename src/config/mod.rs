// SPDX-License-Identifier: MIT

//! Orchestrator configuration: `orchestrator.yaml`, parsed with
//! `serde` + `serde_yaml` the way the teacher's `config/loader.rs` parses
//! its `Config` document — a `#[derive(Deserialize)]` struct tree with
//! `#[serde(default)]` fields and small validated newtypes for anything
//! that needs bounds checking at use time rather than at parse time.

mod consts;
mod ports;

pub use consts::{
    DEFAULT_MAX_WORKERS, DEFAULT_PORT_RANGE_END, DEFAULT_PORT_RANGE_START, DEFAULT_STALL_TIMEOUT_SECS,
    DEFAULT_TERMINATE_GRACE_MS,
};
pub use ports::PortRange;

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::errors::OrchestratorError;
use crate::merge::gate::GateSpec;
use crate::retry::RetryPolicy;

/// Top-level orchestrator configuration, loaded once at startup and shared
/// (read-only) across the Scheduler, Launcher, HeartbeatMonitor, and
/// MergeCoordinator.
///
/// # Example
/// ```yaml
/// launcher:
///   backend: process
/// concurrency:
///   max_workers: 4
/// heartbeat:
///   stall_timeout_secs: 120
/// retry:
///   max_attempts: 3
/// ports:
///   start: 4000
///   end: 4100
/// gates:
///   - name: lint
///     command: cargo
///     args: ["clippy", "--", "-D", "warnings"]
///     required: true
///   - name: test
///     command: cargo
///     args: ["test"]
///     required: true
/// ```
#[derive(Debug, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub launcher: LauncherConfig,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub ports: PortRangeConfig,
    #[serde(default)]
    pub gates: Vec<GateSpec>,
    /// Bumped whenever the gate list or any gate's command changes, so the
    /// gate cache fingerprint (§4.10) invalidates without a filesystem walk
    /// detecting the difference itself.
    #[serde(default = "default_config_version")]
    pub version: String,
}

fn default_config_version() -> String {
    "1".to_string()
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            launcher: LauncherConfig::default(),
            concurrency: ConcurrencyConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            retry: RetryPolicy::default(),
            ports: PortRangeConfig::default(),
            gates: Vec::new(),
            version: default_config_version(),
        }
    }
}

/// Worker backend selection. `auto` is resolved by the launcher factory
/// (devcontainer presence + reachable container runtime + image present)
/// rather than here — this struct only carries the operator's choice or
/// the literal string `"auto"`.
#[derive(Debug, Deserialize)]
pub struct LauncherConfig {
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Image the container backend spawns workers from, and the image
    /// `"auto"` detection checks for local presence before preferring the
    /// container backend over a plain process.
    #[serde(default = "default_worker_image")]
    pub worker_image: String,
}

fn default_backend() -> String {
    "process".to_string()
}

fn default_worker_image() -> String {
    "mahabharatha/worker:latest".to_string()
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            worker_image: default_worker_image(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ConcurrencyConfig {
    pub max_workers: Option<usize>,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self { max_workers: None }
    }
}

impl ConcurrencyConfig {
    pub fn max_workers(&self) -> usize {
        self.max_workers.unwrap_or(DEFAULT_MAX_WORKERS)
    }
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatConfig {
    pub stall_timeout_secs: Option<u64>,
    pub terminate_grace_ms: Option<u64>,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            stall_timeout_secs: None,
            terminate_grace_ms: None,
        }
    }
}

impl HeartbeatConfig {
    pub fn stall_timeout_secs(&self) -> u64 {
        self.stall_timeout_secs.unwrap_or(DEFAULT_STALL_TIMEOUT_SECS)
    }

    /// Bounded wait between a graceful `terminate` and an escalation to a
    /// hard `kill` once a worker is judged stalled.
    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms.unwrap_or(DEFAULT_TERMINATE_GRACE_MS))
    }
}

#[derive(Debug, Deserialize)]
pub struct PortRangeConfig {
    pub start: Option<u16>,
    pub end: Option<u16>,
}

impl Default for PortRangeConfig {
    fn default() -> Self {
        Self {
            start: None,
            end: None,
        }
    }
}

impl PortRangeConfig {
    pub fn resolve(&self) -> PortRange {
        PortRange::new(
            self.start.unwrap_or(DEFAULT_PORT_RANGE_START),
            self.end.unwrap_or(DEFAULT_PORT_RANGE_END),
        )
    }
}

/// Load and parse `orchestrator.yaml`. Unlike the teacher's
/// `load_and_validate_config`, there is no separate dependency-graph
/// validation pass here — that validation belongs to `TaskGraph::load`,
/// not the orchestrator's own settings file.
pub fn load(path: impl AsRef<Path>) -> Result<OrchestratorConfig, OrchestratorError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .map_err(|e| OrchestratorError::Config(format!("reading {}: {e}", path.display())))?;
    serde_yaml::from_str(&content)
        .map_err(|e| OrchestratorError::Config(format!("parsing {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_sections_are_absent() {
        let cfg: OrchestratorConfig = serde_yaml::from_str("gates: []").unwrap();
        assert_eq!(cfg.launcher.backend, "process");
        assert_eq!(cfg.concurrency.max_workers(), DEFAULT_MAX_WORKERS);
        assert_eq!(cfg.heartbeat.stall_timeout_secs(), DEFAULT_STALL_TIMEOUT_SECS);
    }

    #[test]
    fn parses_a_full_document() {
        let yaml = r#"
launcher:
  backend: container
concurrency:
  max_workers: 6
heartbeat:
  stall_timeout_secs: 90
retry:
  max_attempts: 5
ports:
  start: 5000
  end: 5050
gates:
  - name: lint
    command: cargo
    args: ["clippy"]
"#;
        let cfg: OrchestratorConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.launcher.backend, "container");
        assert_eq!(cfg.concurrency.max_workers(), 6);
        assert_eq!(cfg.heartbeat.stall_timeout_secs(), 90);
        assert_eq!(cfg.retry.max_attempts(), 5);
        assert_eq!(cfg.gates.len(), 1);
        let range = cfg.ports.resolve();
        assert_eq!(range.start(), 5000);
        assert_eq!(range.end(), 5050);
    }
}
