// SPDX-License-Identifier: MIT

/// Default worker concurrency when `concurrency.max_workers` is absent.
pub const DEFAULT_MAX_WORKERS: usize = 4;

/// Default stall-detection timeout (spec §4.5).
pub const DEFAULT_STALL_TIMEOUT_SECS: u64 = 120;

/// Default bounded wait between a graceful `terminate` and the escalation
/// to a hard `kill` (spec §4.4/§5).
pub const DEFAULT_TERMINATE_GRACE_MS: u64 = 5_000;

/// Default allocatable port range for worker-bound services.
pub const DEFAULT_PORT_RANGE_START: u16 = 4000;
pub const DEFAULT_PORT_RANGE_END: u16 = 4100;
