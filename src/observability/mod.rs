// SPDX-License-Identifier: MIT

//! Structured logging and tracing for the orchestrator.
//!
//! Message types follow a struct-based pattern with a `Display` impl so
//! human-readable log lines and machine-readable structured fields come
//! from one definition instead of scattered format strings. See
//! [`messages::StructuredLog`].
//!
//! Messages are organized by subsystem:
//! * `messages::state` — state store load/save events
//! * `messages::graph` — task graph validation events
//! * `messages::scheduler` — dispatch decisions
//! * `messages::launcher` — worker spawn/exit events
//! * `messages::heartbeat` — stall detection
//! * `messages::merge` — level merge and gate execution

pub mod messages;
