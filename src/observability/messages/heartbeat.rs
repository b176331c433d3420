// SPDX-License-Identifier: MIT

use std::fmt;

use tracing::Span;

use super::StructuredLog;

pub struct WorkerStalled<'a> {
    pub worker_id: &'a str,
    pub seconds_since_heartbeat: u64,
}

impl fmt::Display for WorkerStalled<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "worker '{}' stalled: no heartbeat for {}s",
            self.worker_id, self.seconds_since_heartbeat
        )
    }
}

impl StructuredLog for WorkerStalled<'_> {
    fn log(&self) {
        tracing::warn!(
            worker_id = self.worker_id,
            seconds_since_heartbeat = self.seconds_since_heartbeat,
            "{}",
            self
        );
    }

    fn span(&self, name: &str) -> Span {
        tracing::warn_span!("worker_stalled", span_name = name, worker_id = self.worker_id)
    }
}
