// SPDX-License-Identifier: MIT

//! Staleness-aware gate result cache. A gate is skipped and its cached
//! verdict reused only when the fingerprint of (working tree contents,
//! gate command, config version) is unchanged since it last ran.

use std::path::Path;

use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::errors::GateError;
use crate::merge::gate::GateSpec;
use crate::state::GateResult;

/// Combines a tree hash over every tracked file under `working_dir` with
/// the gate's command line and the orchestrator config version, so any of
/// the three changing invalidates the cache entry.
pub fn fingerprint(working_dir: &Path, gate: &GateSpec, config_version: &str) -> Result<String, GateError> {
    let mut hasher = Sha256::new();

    let mut entries: Vec<_> = WalkDir::new(working_dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| !e.path().components().any(|c| c.as_os_str() == ".git"))
        .collect();
    entries.sort_by_key(|e| e.path().to_path_buf());

    for entry in entries {
        let bytes = std::fs::read(entry.path()).map_err(|source| GateError::Fingerprint {
            path: entry.path().to_path_buf(),
            source,
        })?;
        hasher.update(entry.path().as_os_str().as_encoded_bytes());
        hasher.update(&bytes);
    }

    hasher.update(gate.name.as_bytes());
    hasher.update(gate.command.as_bytes());
    for arg in &gate.args {
        hasher.update(arg.as_bytes());
    }
    hasher.update(config_version.as_bytes());

    Ok(format!("{:x}", hasher.finalize()))
}

/// `Some(result)` when `cache` holds a passing result for `gate` whose
/// fingerprint still matches `current_fingerprint`; `None` otherwise (the
/// gate must actually run).
pub fn lookup<'a>(
    cache: &'a std::collections::HashMap<String, GateResult>,
    gate_name: &str,
    current_fingerprint: &str,
) -> Option<&'a GateResult> {
    cache
        .get(gate_name)
        .filter(|cached| cached.passed() && cached.fingerprint == current_fingerprint)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn fingerprint_changes_when_a_file_changes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"one").unwrap();
        let gate = GateSpec {
            name: "lint".into(),
            command: "true".into(),
            args: vec![],
            required: true,
            timeout_seconds: 60,
        };
        let before = fingerprint(dir.path(), &gate, "v1").unwrap();

        std::fs::write(dir.path().join("a.txt"), b"two").unwrap();
        let after = fingerprint(dir.path(), &gate, "v1").unwrap();

        assert_ne!(before, after);
    }

    #[test]
    fn fingerprint_changes_when_config_version_changes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"one").unwrap();
        let gate = GateSpec {
            name: "lint".into(),
            command: "true".into(),
            args: vec![],
            required: true,
            timeout_seconds: 60,
        };
        let v1 = fingerprint(dir.path(), &gate, "v1").unwrap();
        let v2 = fingerprint(dir.path(), &gate, "v2").unwrap();
        assert_ne!(v1, v2);
    }

    #[test]
    fn lookup_misses_when_fingerprint_is_stale() {
        let mut cache = HashMap::new();
        cache.insert(
            "lint".to_string(),
            GateResult {
                gate_name: "lint".into(),
                outcome: crate::state::GateOutcome::Pass,
                exit_code: Some(0),
                log_path: "log".into(),
                fingerprint: "old".into(),
                ran_at: chrono::Utc::now(),
            },
        );
        assert!(lookup(&cache, "lint", "new").is_none());
        assert!(lookup(&cache, "lint", "old").is_some());
    }

    #[test]
    fn lookup_misses_a_previously_failed_gate_even_with_matching_fingerprint() {
        let mut cache = HashMap::new();
        cache.insert(
            "lint".to_string(),
            GateResult {
                gate_name: "lint".into(),
                outcome: crate::state::GateOutcome::Fail,
                exit_code: Some(1),
                log_path: "log".into(),
                fingerprint: "same".into(),
                ran_at: chrono::Utc::now(),
            },
        );
        assert!(lookup(&cache, "lint", "same").is_none());
    }
}
