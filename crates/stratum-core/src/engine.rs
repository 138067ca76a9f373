//! The engine facade wiring every component behind the exposed API.
//!
//! Collaborators (transport, task layer, dashboards) talk to
//! [`RetentionEngine`]: store/retrieve/promote/demote entries, inject
//! rewards, feed cycle events, subscribe to lifecycle events, and pull
//! analytics. Everything else stays internal.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::info;

use crate::analytics::{
    AnalyticsReport, QValueDistribution, RetentionStats, SurpriseHistogram,
};
use crate::config::EngineConfig;
use crate::domain::{CycleEvent, EntryDraft, EntryId, MemoryEntry, Phase, Result, Stratum};
use crate::events::{EngineEvent, EventBus};
use crate::orchestrator::{
    ActionRunner, CancelFlag, ConsolidationReport, CycleReport, DualLoopOrchestrator,
};
use crate::store::{EntryFilter, SweepReport, StratumStore};
use crate::surprise::SurpriseEngine;
use crate::utility::UtilityScorer;
use stratum_state::{Clock, DocumentStore, MemoryDocStore, SystemClock};

/// Multi-tier memory retention engine.
pub struct RetentionEngine {
    config: EngineConfig,
    bus: EventBus,
    scorer: Arc<UtilityScorer>,
    store: Arc<StratumStore>,
    orchestrator: Arc<DualLoopOrchestrator>,
}

impl RetentionEngine {
    /// Build an engine over the given persistence boundary and clock.
    pub fn new(config: EngineConfig, docs: Arc<dyn DocumentStore>, clock: Arc<dyn Clock>) -> Self {
        let bus = EventBus::default();
        let scorer = Arc::new(UtilityScorer::new(
            config.q_learning_rate,
            config.initial_q,
            config.lambda,
        ));
        let store = Arc::new(StratumStore::new(
            &config,
            docs,
            clock.clone(),
            bus.clone(),
            scorer.clone(),
        ));
        let surprise = Arc::new(SurpriseEngine::new(&config, clock.clone()));
        let orchestrator = Arc::new(DualLoopOrchestrator::new(
            &config,
            store.clone(),
            surprise,
            scorer.clone(),
            bus.clone(),
            clock,
        ));

        Self {
            config,
            bus,
            scorer,
            store,
            orchestrator,
        }
    }

    /// Engine with in-memory persistence and the system clock: the
    /// embedded/testing configuration.
    pub fn in_memory(config: EngineConfig) -> Self {
        Self::new(
            config,
            Arc::new(MemoryDocStore::new()),
            Arc::new(SystemClock),
        )
    }

    /// Load persisted entries into the arena (call once at startup when
    /// reattaching to a durable backend).
    pub async fn hydrate(&self) -> Result<usize> {
        let count = self.store.hydrate().await?;
        info!(count, "engine hydrated");
        Ok(count)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Subscribe to engine lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.bus.subscribe()
    }

    // -- memory surface -----------------------------------------------------

    /// Store a new entry.
    pub async fn store(&self, draft: EntryDraft) -> Result<EntryId> {
        self.store.store(draft).await
    }

    /// Fetch one entry by id, recording the access.
    pub async fn get(&self, id: &EntryId) -> Result<MemoryEntry> {
        self.store.get(id).await
    }

    /// Phase-aware retrieval: filter one stratum, then rank by the blended
    /// relevance score. Similarity is tag overlap against the filter's tag
    /// set; callers with their own similarity signal should use
    /// [`RetentionEngine::rank`] on the filtered results instead.
    pub async fn retrieve(
        &self,
        stratum: Stratum,
        filter: &EntryFilter,
        phase: Phase,
    ) -> Result<Vec<MemoryEntry>> {
        let entries = self.store.query(stratum, filter).await?;
        let similarities: Vec<f64> = entries
            .iter()
            .map(|e| {
                if filter.tags.is_empty() {
                    0.0
                } else {
                    let matched = filter.tags.iter().filter(|t| e.tags.contains(*t)).count();
                    matched as f64 / filter.tags.len() as f64
                }
            })
            .collect();
        Ok(self.rank(entries, &similarities, phase))
    }

    /// Rank entries by `(1 - lambda) * similarity + lambda * Q` for the
    /// phase. `similarities` pairs with `entries` by index; missing values
    /// count as zero similarity.
    pub fn rank(
        &self,
        entries: Vec<MemoryEntry>,
        similarities: &[f64],
        phase: Phase,
    ) -> Vec<MemoryEntry> {
        let mut scored: Vec<(f64, MemoryEntry)> = entries
            .into_iter()
            .enumerate()
            .map(|(i, entry)| {
                let similarity = similarities.get(i).copied().unwrap_or(0.0);
                let q = self.scorer.q(&entry.id).unwrap_or(entry.utility);
                (self.scorer.retrieval_score(q, similarity, phase), entry)
            })
            .collect();
        scored.sort_by(|(a, ea), (b, eb)| {
            b.partial_cmp(a)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| ea.id.cmp(&eb.id))
        });
        scored.into_iter().map(|(_, e)| e).collect()
    }

    /// Promote an entry to a strictly older stratum.
    pub async fn promote(&self, id: &EntryId, target: Stratum) -> Result<EntryId> {
        self.store.promote(id, target).await
    }

    /// Demote an entry to a strictly newer stratum.
    pub async fn demote(&self, id: &EntryId, target: Stratum) -> Result<EntryId> {
        self.store.demote(id, target).await
    }

    /// Delete an entry, cascading out of related sets.
    pub async fn delete(&self, id: &EntryId) -> Result<()> {
        self.store.delete(id).await
    }

    // -- learning surface ---------------------------------------------------

    /// Inject a reward signal for an entry.
    ///
    /// Updates the Q-value, and for positive rewards also refreshes
    /// retention (multiplier `1 + reward * reward_retention_boost`).
    /// Reward-path and task-outcome updates are sequential, commutative
    /// calls into the same primitives.
    pub async fn inject_reward(&self, id: &EntryId, reward: f64, reason: &str) -> Result<f64> {
        let q = self.scorer.update(id, reward)?;
        info!(id = %id, reward, reason, q, "reward injected");

        if reward > 0.0 {
            let multiplier = 1.0 + reward.min(1.0) * self.config.reward_retention_boost;
            self.store.apply_reward(std::slice::from_ref(id), multiplier).await?;
        }
        Ok(q)
    }

    // -- loop surface -------------------------------------------------------

    /// Feed one cycle event through the inner loop. When episodic pressure
    /// crosses the consolidation trigger, an outer-loop pass runs for the
    /// event's channel before returning.
    pub async fn observe_cycle(
        &self,
        event: CycleEvent,
        runner: &dyn ActionRunner,
        cancel: &CancelFlag,
    ) -> Result<CycleReport> {
        let channel = event.channel_id.clone();
        let report = self.orchestrator.run_cycle(event, runner, cancel).await?;

        if self.orchestrator.should_consolidate().await {
            self.orchestrator.consolidate(&channel).await?;
        }
        Ok(report)
    }

    /// Run one consolidation pass for a scope.
    pub async fn consolidate(&self, scope: &str) -> Result<ConsolidationReport> {
        self.orchestrator.consolidate(scope).await
    }

    /// Sweep without compression (explicit maintenance entry point).
    pub async fn sweep(&self) -> Result<SweepReport> {
        self.store.sweep(None).await
    }

    /// Handle for hosting the periodic outer loop.
    pub fn orchestrator(&self) -> Arc<DualLoopOrchestrator> {
        self.orchestrator.clone()
    }

    // -- analytics ----------------------------------------------------------

    /// Snapshot of Q distribution, retention stats, and surprise histogram.
    pub async fn get_analytics(&self) -> Result<AnalyticsReport> {
        let entries = self.store.snapshot().await;
        let q_values: Vec<f64> = self.scorer.snapshot().iter().map(|(_, q)| *q).collect();
        let scores = self.store.surprise_scores().await?;

        // The gate's clock and the store's are the same instant source;
        // chrono::Utc::now is close enough for a snapshot boundary.
        let now = chrono::Utc::now();
        Ok(AnalyticsReport {
            q_values: QValueDistribution::from_values(&q_values),
            retention: RetentionStats::from_entries(&entries, self.store.gate(), now),
            surprise: SurpriseHistogram::from_scores(&scores),
            generated_at: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::EntrySource;

    fn engine() -> RetentionEngine {
        RetentionEngine::in_memory(EngineConfig::default())
    }

    fn draft(body: &str, importance: u8) -> EntryDraft {
        EntryDraft::text(body, importance, EntrySource::new("agent-1", "chan-1"))
    }

    #[tokio::test]
    async fn store_retrieve_promote_surface() {
        let engine = engine();
        let id = engine.store(draft("fact", 4).with_tag("kb")).await.unwrap();

        let results = engine
            .retrieve(
                Stratum::Working,
                &EntryFilter::any().with_tag("kb"),
                Phase::Reason,
            )
            .await
            .unwrap();
        assert_eq!(results.len(), 1);

        let new_id = engine.promote(&id, Stratum::ShortTerm).await.unwrap();
        assert!(engine.get(&new_id).await.is_ok());
        assert!(engine.get(&id).await.is_err());
    }

    #[tokio::test]
    async fn inject_reward_moves_q_and_refreshes_retention() {
        let engine = engine();
        let id = engine.store(draft("useful", 3)).await.unwrap();

        let q = engine.inject_reward(&id, 1.0, "task solved").await.unwrap();
        assert!(q > engine.config().initial_q);

        let entry = engine.get(&id).await.unwrap();
        // 0.5 * (1 + 1.0 * 0.5) = 0.75
        assert!((entry.retention.initial_weight - 0.75).abs() < 1e-9);
    }

    #[tokio::test]
    async fn inject_reward_unknown_entry_fails() {
        let engine = engine();
        let err = engine
            .inject_reward(&EntryId("ghost".into()), 0.5, "test")
            .await
            .unwrap_err();
        assert!(matches!(err, crate::domain::EngineError::UnknownEntry { .. }));
    }

    #[tokio::test]
    async fn ranking_prefers_high_q_in_planning() {
        let engine = engine();
        let low = engine.store(draft("low utility", 3)).await.unwrap();
        let high = engine.store(draft("high utility", 3)).await.unwrap();
        for _ in 0..30 {
            engine.inject_reward(&high, 1.0, "useful").await.unwrap();
            engine.inject_reward(&low, -1.0, "useless").await.unwrap();
        }

        let entries = vec![
            engine.get(&low).await.unwrap(),
            engine.get(&high).await.unwrap(),
        ];
        // Equal similarity: utility decides under the planning lambda.
        let ranked = engine.rank(entries, &[0.5, 0.5], Phase::Plan);
        assert_eq!(ranked[0].id, high);
    }

    #[tokio::test]
    async fn analytics_reflect_stored_state() {
        let engine = engine();
        engine.store(draft("a", 3)).await.unwrap();
        engine.store(draft("b", 5)).await.unwrap();

        let report = engine.get_analytics().await.unwrap();
        assert_eq!(report.q_values.count, 2);
        assert_eq!(
            report.retention.per_stratum[&Stratum::Working].count,
            2
        );
    }
}
