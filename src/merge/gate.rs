// SPDX-License-Identifier: MIT

//! Quality gate execution: a gate is a named shell-style command with a
//! timeout and a `required` flag. Spawned with `tokio::process::Command`,
//! matching the launcher's process-spawn idiom. A `required` gate that
//! times out or exits nonzero aborts the merge; a non-required gate only
//! logs and lets the pipeline continue.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::time::timeout;

use crate::errors::GateError;

fn default_required() -> bool {
    true
}

fn default_timeout_seconds() -> u64 {
    600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateSpec {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateVerdict {
    Pass,
    Fail,
    Timeout,
}

pub struct GateOutcome {
    pub verdict: GateVerdict,
    pub exit_code: Option<i32>,
    pub log: String,
}

impl GateOutcome {
    /// A non-required gate never blocks the merge, regardless of verdict;
    /// a required gate blocks on anything but `Pass`.
    pub fn blocks_merge(&self, required: bool) -> bool {
        required && self.verdict != GateVerdict::Pass
    }
}

pub async fn run_gate(gate: &GateSpec, working_dir: &Path) -> Result<GateOutcome, GateError> {
    let run = Command::new(&gate.command)
        .args(&gate.args)
        .current_dir(working_dir)
        .output();

    let result = timeout(Duration::from_secs(gate.timeout_seconds), run).await;

    let output = match result {
        Ok(Ok(output)) => output,
        Ok(Err(source)) => {
            return Err(GateError::Spawn {
                gate_name: gate.name.clone(),
                source,
            })
        }
        Err(_elapsed) => {
            return Ok(GateOutcome {
                verdict: GateVerdict::Timeout,
                exit_code: None,
                log: format!(
                    "gate '{}' timed out after {}s",
                    gate.name, gate.timeout_seconds
                ),
            })
        }
    };

    let mut log = String::from_utf8_lossy(&output.stdout).into_owned();
    log.push_str(&String::from_utf8_lossy(&output.stderr));

    let verdict = if output.status.success() {
        GateVerdict::Pass
    } else {
        GateVerdict::Fail
    };

    Ok(GateOutcome {
        verdict,
        exit_code: output.status.code(),
        log,
    })
}
