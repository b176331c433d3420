// SPDX-License-Identifier: MIT

//! Retry/backoff policy and failure-cause classification.
//!
//! `RetryPolicy` follows the same validated/clamped-config shape as the
//! teacher's `FuelConfig`: bounds come from config with sane defaults, and
//! a `clamp` method keeps a requested value inside them rather than
//! rejecting it outright.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::state::EscalationCause;

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_BASE_DELAY_MS: u64 = 2_000;
const DEFAULT_MAX_DELAY_MS: u64 = 60_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub base_delay_ms: Option<u64>,
    #[serde(default)]
    pub max_delay_ms: Option<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            base_delay_ms: None,
            max_delay_ms: None,
        }
    }
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS)
    }

    pub fn base_delay_ms(&self) -> u64 {
        self.base_delay_ms.unwrap_or(DEFAULT_BASE_DELAY_MS)
    }

    pub fn max_delay_ms(&self) -> u64 {
        self.max_delay_ms.unwrap_or(DEFAULT_MAX_DELAY_MS)
    }

    /// Exponential backoff with full jitter, clamped to `max_delay_ms`.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self.base_delay_ms().saturating_mul(1u64 << attempt.min(20));
        let capped = exp.min(self.max_delay_ms());
        let jittered = rand::thread_rng().gen_range(0..=capped.max(1));
        Duration::from_millis(jittered)
    }

    pub fn should_retry(&self, attempts_so_far: u32) -> bool {
        attempts_so_far < self.max_attempts()
    }
}

/// Classifies why a worker failed into a retry-vs-escalate decision.
/// Ambiguous failures default to `VerificationFailed` (retryable) per
/// spec §9's open-question resolution — never silently escalate.
pub fn classify_failure(crash_detected: bool, stall_detected: bool, gate_failed: bool, timed_out: bool) -> EscalationCause {
    if stall_detected || crash_detected {
        EscalationCause::StallOrCrash
    } else if timed_out {
        EscalationCause::VerificationTimeout
    } else if gate_failed {
        EscalationCause::MergeConflict
    } else {
        EscalationCause::VerificationFailed
    }
}

pub fn is_retryable(cause: EscalationCause) -> bool {
    !matches!(
        cause,
        EscalationCause::AmbiguousSpec
            | EscalationCause::MissingDependency
            | EscalationCause::MergeConflict
    )
}
