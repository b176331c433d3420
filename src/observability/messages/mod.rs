// SPDX-License-Identifier: MIT

//! Centralized message types for structured logging and distributed tracing.
//!
//! Each message type implements `Display` for a human-readable line and
//! [`StructuredLog`] for machine-readable fields plus an OpenTelemetry span.
//! Organized by subsystem: `state`, `graph`, `scheduler`, `launcher`,
//! `heartbeat`, `merge`.
//!
//! ```rust
//! use mahabharatha::observability::messages::{StructuredLog, state::StateSaved};
//!
//! StateSaved { feature: "widget-export", sequence: 7 }.log();
//! ```

pub mod graph;
pub mod heartbeat;
pub mod launcher;
pub mod merge;
pub mod scheduler;
pub mod state;

use tracing::Span;

/// Messages that support both structured logging and distributed tracing.
pub trait StructuredLog {
    /// Emit a log event: the human-readable `Display` line plus structured fields.
    fn log(&self);

    /// Create a span named `name` carrying this message's fields as attributes.
    fn span(&self, name: &str) -> Span;
}
