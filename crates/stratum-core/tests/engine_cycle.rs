//! Inner-loop cycles through the engine facade: elevated surprise encoding,
//! the consolidation trigger, analytics, and the dropped-write path.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use stratum_core::config::PhaseWeights;
use stratum_core::events::EventBus;
use stratum_core::store::{EntryFilter, StratumStore};
use stratum_core::utility::UtilityScorer;
use stratum_core::{
    ActionOutcome, ActionRunner, CancelFlag, CycleEvent, EngineConfig, EngineError, EngineEvent,
    EntryDraft, EntrySource, Outcome, Patch, Phase, RetentionEngine, Stratum,
};
use stratum_state::{
    Collection, DocId, DocQuery, Document, DocumentStore, MemoryDocStore, StorageError,
    StorageResult, SystemClock,
};

struct OkRunner;

#[async_trait]
impl ActionRunner for OkRunner {
    async fn run(&self, _agent_id: &str, _plan: &str) -> ActionOutcome {
        ActionOutcome {
            success: true,
            retry_count: 0,
            detail: "ok".into(),
        }
    }
    async fn apply_patch(&self, _agent_id: &str, _patch: &Patch) -> bool {
        true
    }
}

fn event(description: &str, expected: Outcome, actual: Outcome) -> CycleEvent {
    CycleEvent {
        agent_id: "agent-1".into(),
        channel_id: "chan-1".into(),
        cycle: 1,
        phase: Phase::Observe,
        expected,
        actual,
        description: description.into(),
        tags: BTreeSet::from(["ops".to_string()]),
    }
}

#[tokio::test]
async fn surprising_observation_is_elevated_into_episodic() {
    let engine = RetentionEngine::in_memory(EngineConfig::default());

    // First deviation against zero momentum: score = 1.0 / epsilon >> 0.7.
    let report = engine
        .observe_cycle(
            event(
                "deploy health check",
                Outcome::Label("healthy".into()),
                Outcome::Label("degraded".into()),
            ),
            &OkRunner,
            &CancelFlag::new(),
        )
        .await
        .unwrap();

    assert!(report.elevated);
    assert!(report.surprise_score > engine.config().surprise_threshold);

    let elevated = engine
        .retrieve(
            Stratum::Episodic,
            &EntryFilter::any().with_tag("elevated"),
            Phase::Observe,
        )
        .await
        .unwrap();
    assert_eq!(elevated.len(), 1, "written to Episodic, not Working");
    assert_eq!(elevated[0].importance, 4, "base 3 amplified by surprise");
    assert!(elevated[0].tags.contains("observation"));
}

#[tokio::test]
async fn unsurprising_observation_stays_in_working() {
    let engine = RetentionEngine::in_memory(EngineConfig::default());

    let report = engine
        .observe_cycle(
            event(
                "routine check",
                Outcome::Label("healthy".into()),
                Outcome::Label("healthy".into()),
            ),
            &OkRunner,
            &CancelFlag::new(),
        )
        .await
        .unwrap();

    assert!(!report.elevated);
    assert_eq!(report.surprise_score, 0.0);

    let observations = engine
        .retrieve(
            Stratum::Working,
            &EntryFilter::any().with_tag("observation"),
            Phase::Observe,
        )
        .await
        .unwrap();
    assert_eq!(observations.len(), 1);
    assert_eq!(observations[0].importance, 3);
}

#[tokio::test]
async fn episodic_pressure_triggers_consolidation() {
    let mut config = EngineConfig::default();
    config.consolidation_trigger = 2;
    let engine = RetentionEngine::in_memory(config);

    for i in 0..2 {
        engine
            .observe_cycle(
                event(
                    &format!("incident {i}"),
                    Outcome::Numeric(0.0),
                    Outcome::Numeric(1.0),
                ),
                &OkRunner,
                &CancelFlag::new(),
            )
            .await
            .unwrap();
    }

    // The second cycle crossed the trigger and consolidated, resetting
    // the pressure counter.
    assert!(!engine.orchestrator().should_consolidate().await);
}

#[tokio::test]
async fn analytics_track_cycles() {
    let engine = RetentionEngine::in_memory(EngineConfig::default());

    engine
        .observe_cycle(
            event(
                "first check",
                Outcome::Numeric(1.0),
                Outcome::Numeric(3.0),
            ),
            &OkRunner,
            &CancelFlag::new(),
        )
        .await
        .unwrap();

    let analytics = engine.get_analytics().await.unwrap();
    assert_eq!(analytics.surprise.count, 1, "one surprise recorded");
    assert!(analytics.q_values.count >= 3, "cycle writes registered entries");
    let total: usize = analytics
        .retention
        .per_stratum
        .values()
        .map(|s| s.count)
        .sum();
    assert!(total >= 3, "observation, plan, reflection all live");
}

#[tokio::test]
async fn momentum_dampens_repeated_surprises() {
    let engine = RetentionEngine::in_memory(EngineConfig::default());

    let mut scores = Vec::new();
    for i in 0..4 {
        let report = engine
            .observe_cycle(
                event(
                    &format!("repeat offender {i}"),
                    Outcome::Numeric(0.0),
                    Outcome::Numeric(1.0),
                ),
                &OkRunner,
                &CancelFlag::new(),
            )
            .await
            .unwrap();
        scores.push(report.surprise_score);
    }

    // The cold-start score is huge; once momentum exists the same
    // deviation reads as ordinary.
    assert!(scores[0] > 5.0, "cold start should spike: {scores:?}");
    for s in &scores[1..] {
        assert!(*s < scores[0] / 5.0, "momentum failed to dampen: {scores:?}");
    }
}

// ---------------------------------------------------------------------------
// Dropped writes
// ---------------------------------------------------------------------------

/// Document store whose writes fail while `broken` is set.
struct FlakyDocStore {
    inner: MemoryDocStore,
    broken: AtomicBool,
}

impl FlakyDocStore {
    fn new() -> Self {
        Self {
            inner: MemoryDocStore::new(),
            broken: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl DocumentStore for FlakyDocStore {
    async fn put(&self, doc: Document) -> StorageResult<()> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(StorageError::Connection("backend offline".into()));
        }
        self.inner.put(doc).await
    }

    async fn get(&self, collection: Collection, id: &DocId) -> StorageResult<Document> {
        self.inner.get(collection, id).await
    }

    async fn delete(&self, collection: Collection, id: &DocId) -> StorageResult<()> {
        self.inner.delete(collection, id).await
    }

    async fn query(&self, q: &DocQuery) -> StorageResult<Vec<Document>> {
        self.inner.query(q).await
    }

    async fn expire_due(&self, now: DateTime<Utc>) -> StorageResult<Vec<DocId>> {
        self.inner.expire_due(now).await
    }
}

#[tokio::test]
async fn exhausted_retries_drop_the_write_and_record_it() {
    let mut config = EngineConfig::default();
    config.storage_retry.max_attempts = 2;
    config.storage_retry.base_delay_ms = 1;

    let docs = Arc::new(FlakyDocStore::new());
    let bus = EventBus::default();
    let mut events = bus.subscribe();
    let scorer = Arc::new(UtilityScorer::new(
        config.q_learning_rate,
        config.initial_q,
        PhaseWeights::default(),
    ));
    let store = StratumStore::new(
        &config,
        docs.clone(),
        Arc::new(SystemClock),
        bus,
        scorer,
    );

    docs.broken.store(true, Ordering::SeqCst);
    let err = store
        .store(EntryDraft::text(
            "unlucky write",
            3,
            EntrySource::new("agent-1", "chan-1"),
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::StorageUnavailable { attempts: 2, .. }));

    let mut saw_missed_write = false;
    while let Ok(ev) = events.try_recv() {
        if let EngineEvent::MissedWrite { collection, .. } = ev {
            assert_eq!(collection, "entries");
            saw_missed_write = true;
        }
    }
    assert!(saw_missed_write, "dropped write recorded for reconciliation");

    // The write really was dropped, and the agent keeps going afterwards.
    docs.broken.store(false, Ordering::SeqCst);
    let id = store
        .store(EntryDraft::text(
            "later write",
            3,
            EntrySource::new("agent-1", "chan-1"),
        ))
        .await
        .unwrap();
    assert!(store.get(&id).await.is_ok());
    assert_eq!(store.counts().await[&Stratum::Working], 1);
}
