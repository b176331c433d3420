// SPDX-License-Identifier: MIT

use std::fmt;

use tracing::Span;

use super::StructuredLog;

pub struct StateSaved<'a> {
    pub feature: &'a str,
    pub sequence: u64,
}

impl fmt::Display for StateSaved<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "saved state for feature '{}' at sequence {}",
            self.feature, self.sequence
        )
    }
}

impl StructuredLog for StateSaved<'_> {
    fn log(&self) {
        tracing::debug!(feature = self.feature, sequence = self.sequence, "{}", self);
    }

    fn span(&self, name: &str) -> Span {
        tracing::debug_span!("state_save", span_name = name, feature = self.feature, sequence = self.sequence)
    }
}

pub struct StateLoadFailed<'a> {
    pub feature: &'a str,
    pub reason: &'a str,
}

impl fmt::Display for StateLoadFailed<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "primary state document for '{}' failed to load ({}), recovered from .bak",
            self.feature, self.reason
        )
    }
}

impl StructuredLog for StateLoadFailed<'_> {
    fn log(&self) {
        tracing::warn!(feature = self.feature, reason = self.reason, "{}", self);
    }

    fn span(&self, name: &str) -> Span {
        tracing::warn_span!("state_load_failed", span_name = name, feature = self.feature)
    }
}
