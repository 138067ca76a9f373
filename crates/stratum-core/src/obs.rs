//! Structured observability hooks for memory lifecycle events.
//!
//! This module provides:
//! - Agent-scoped tracing spans via the `AgentSpan` RAII guard
//! - Emission functions for key lifecycle moments: entry creation,
//!   placement changes, sweep completion, mode changes, missed writes
//!
//! Events are emitted at `info!` level; set `RUST_LOG` for filtering and
//! use [`crate::telemetry::init_tracing`] with `json = true` for log
//! aggregation pipelines.

use tracing::{info, warn};

use crate::domain::Stratum;
use crate::events::Mode;

/// RAII guard that enters an agent-scoped tracing span.
///
/// All tracing calls inside the guard's lifetime are associated with the
/// agent id.
pub struct AgentSpan {
    _span: tracing::span::EnteredSpan,
}

impl AgentSpan {
    /// Create and enter a span tagged with the agent id.
    pub fn enter(agent_id: &str) -> Self {
        let span = tracing::info_span!("stratum.agent", agent_id = %agent_id);
        Self {
            _span: span.entered(),
        }
    }
}

/// Emit event: entry created in a stratum.
pub fn emit_entry_created(id: &str, stratum: Stratum, importance: u8) {
    info!(event = "entry.created", id = %id, stratum = %stratum, importance = importance);
}

/// Emit event: entry moved between strata.
pub fn emit_entry_moved(from_id: &str, new_id: &str, from: Stratum, to: Stratum) {
    info!(
        event = "entry.moved",
        from_id = %from_id,
        new_id = %new_id,
        from = %from,
        to = %to,
    );
}

/// Emit event: sweep pass finished.
pub fn emit_sweep_finished(promoted: usize, demoted: usize, expired: usize) {
    info!(
        event = "sweep.finished",
        promoted = promoted,
        demoted = demoted,
        expired = expired,
    );
}

/// Emit event: orchestrator mode change.
pub fn emit_mode_changed(agent_id: &str, mode: Mode) {
    info!(event = "mode.changed", agent_id = %agent_id, mode = %mode);
}

/// Emit event: a persistence write was dropped after retries (warning level).
pub fn emit_missed_write(collection: &str, id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "store.missed_write", collection = %collection, id = %id, error = %error);
}
