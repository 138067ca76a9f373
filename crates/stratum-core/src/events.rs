//! Engine lifecycle events and the broadcast bus carrying them.
//!
//! Collaborators subscribe via [`EventBus::subscribe`]; the engine emits on
//! every placement change, surprise, pattern detection, mode change, and
//! repair outcome. Emission never blocks and never fails: with no live
//! subscribers events are dropped.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::domain::{EntryId, PatternId, PatternKind, Stratum};

/// Orchestrator mode axis, orthogonal to the inner-loop phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Solver,
    Verifier,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Solver => write!(f, "solver"),
            Mode::Verifier => write!(f, "verifier"),
        }
    }
}

/// Lifecycle event emitted by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum EngineEvent {
    EntryCreated {
        id: EntryId,
        stratum: Stratum,
        agent_id: String,
    },
    EntryPromoted {
        from_id: EntryId,
        new_id: EntryId,
        from: Stratum,
        to: Stratum,
    },
    EntryDemoted {
        from_id: EntryId,
        new_id: EntryId,
        from: Stratum,
        to: Stratum,
    },
    EntryExpired {
        id: EntryId,
        stratum: Stratum,
    },
    EntryDeleted {
        id: EntryId,
    },
    SurpriseRecorded {
        agent_id: String,
        context_key: String,
        score: f64,
        elevated: bool,
    },
    PatternDetected {
        id: PatternId,
        kind: PatternKind,
        frequency: u32,
    },
    ModeChanged {
        agent_id: String,
        mode: Mode,
    },
    PatchApplied {
        agent_id: String,
        attempt: u32,
    },
    SelfRepairExhausted {
        agent_id: String,
        attempts: u32,
    },
    /// A persistence write was dropped after retry exhaustion; recorded for
    /// later reconciliation.
    MissedWrite {
        collection: String,
        id: String,
        reason: String,
    },
}

/// Broadcast bus for [`EngineEvent`].
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    /// Create a bus retaining up to `capacity` undelivered events per
    /// subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Emit an event. Dropped silently when nobody is listening.
    pub fn emit(&self, event: EngineEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("engine event dropped: no subscribers");
        }
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_emitted_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        bus.emit(EngineEvent::EntryCreated {
            id: EntryId("e1".into()),
            stratum: Stratum::Working,
            agent_id: "agent-1".into(),
        });

        match rx.recv().await.unwrap() {
            EngineEvent::EntryCreated { id, stratum, .. } => {
                assert_eq!(id, EntryId("e1".into()));
                assert_eq!(stratum, Stratum::Working);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn emit_without_subscribers_is_silent() {
        let bus = EventBus::new(8);
        bus.emit(EngineEvent::EntryDeleted {
            id: EntryId("gone".into()),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn event_serde_uses_snake_case_tags() {
        let json = serde_json::to_string(&EngineEvent::ModeChanged {
            agent_id: "a".into(),
            mode: Mode::Verifier,
        })
        .unwrap();
        assert!(json.contains("mode_changed"));
        assert!(json.contains("verifier"));
    }
}
