//! The five-tier stratum store.
//!
//! Entries live in an arena keyed by id with a separate stratum index, so a
//! promotion is an index update plus a re-keyed replacement, never a live
//! duplicate. All placement changes go through a single writer lock; a
//! concurrent reader sees the pre- or post-move entry, never a torn one.
//!
//! Persistence goes through the `DocumentStore` boundary with bounded
//! exponential backoff. A write that exhausts its retries is dropped, not
//! silently lost: it surfaces as `StorageUnavailable` and a missed-write
//! event for later reconciliation.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::compressor::MemoryCompressor;
use crate::config::{EngineConfig, RetryPolicy, StratumTtls};
use crate::domain::{
    EngineError, EntryDraft, EntryId, MemoryEntry, MemoryPattern, Result, Stratum, SurpriseRecord,
};
use crate::events::{EngineEvent, EventBus};
use crate::metrics::METRICS;
use crate::obs;
use crate::retention::{RetentionGate, SweepAction, SweepOutcome};
use crate::utility::UtilityScorer;
use stratum_state::{Clock, Collection, DocId, DocQuery, Document, DocumentStore, StorageError};

// ---------------------------------------------------------------------------
// Query filter
// ---------------------------------------------------------------------------

/// Conjunctive filter for stratum queries: every clause must hold.
#[derive(Debug, Clone, Default)]
pub struct EntryFilter {
    pub tags: BTreeSet<String>,
    pub min_importance: Option<u8>,
    pub min_access_count: Option<u64>,
}

impl EntryFilter {
    /// Filter matching every entry.
    pub fn any() -> Self {
        Self::default()
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn min_importance(mut self, importance: u8) -> Self {
        self.min_importance = Some(importance);
        self
    }

    pub fn min_access_count(mut self, count: u64) -> Self {
        self.min_access_count = Some(count);
        self
    }

    fn matches(&self, entry: &MemoryEntry) -> bool {
        if !self.tags.iter().all(|t| entry.tags.contains(t)) {
            return false;
        }
        if let Some(min) = self.min_importance {
            if entry.importance < min {
                return false;
            }
        }
        if let Some(min) = self.min_access_count {
            if entry.access_count < min {
                return false;
            }
        }
        true
    }
}

/// Sweep result plus the patterns compression surfaced along the way.
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    pub outcome: SweepOutcome,
    pub patterns: Vec<MemoryPattern>,
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct StoreState {
    entries: HashMap<EntryId, MemoryEntry>,
    by_stratum: BTreeMap<Stratum, BTreeSet<EntryId>>,
    /// New Episodic entries since the last consolidation, for the outer-loop
    /// trigger.
    episodic_pressure: usize,
}

impl StoreState {
    fn insert(&mut self, entry: MemoryEntry) {
        self.by_stratum
            .entry(entry.stratum)
            .or_default()
            .insert(entry.id.clone());
        if entry.stratum == Stratum::Episodic {
            self.episodic_pressure += 1;
        }
        self.entries.insert(entry.id.clone(), entry);
    }

    fn remove(&mut self, id: &EntryId) -> Option<MemoryEntry> {
        let entry = self.entries.remove(id)?;
        if let Some(ids) = self.by_stratum.get_mut(&entry.stratum) {
            ids.remove(id);
        }
        Some(entry)
    }
}

// ---------------------------------------------------------------------------
// StratumStore
// ---------------------------------------------------------------------------

enum MoveKind {
    Promote,
    Demote,
}

/// Arena + stratum index over all live memory entries.
pub struct StratumStore {
    state: RwLock<StoreState>,
    docs: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    bus: EventBus,
    scorer: Arc<UtilityScorer>,
    gate: RetentionGate,
    retry: RetryPolicy,
    ttls: StratumTtls,
}

impl StratumStore {
    pub fn new(
        config: &EngineConfig,
        docs: Arc<dyn DocumentStore>,
        clock: Arc<dyn Clock>,
        bus: EventBus,
        scorer: Arc<UtilityScorer>,
    ) -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            docs,
            clock,
            bus,
            scorer,
            gate: RetentionGate::from_config(config),
            retry: config.storage_retry,
            ttls: config.entry_ttls,
        }
    }

    /// The retention gate this store sweeps with.
    pub fn gate(&self) -> &RetentionGate {
        &self.gate
    }

    // -- persistence helpers ------------------------------------------------

    fn entry_document(&self, entry: &MemoryEntry) -> Document {
        let mut entry = entry.clone();
        if let Some(q) = self.scorer.q(&entry.id) {
            entry.utility = q;
        }
        Document {
            id: DocId(entry.id.0.clone()),
            collection: Collection::Entries,
            owner: Some(entry.source.agent_id.clone()),
            channel: Some(entry.source.channel_id.clone()),
            stratum: Some(entry.stratum.as_str().to_string()),
            tags: entry.tags.iter().cloned().collect(),
            importance: Some(entry.importance),
            last_accessed_at: Some(entry.last_accessed_at),
            expires_at: entry.expires_at,
            created_at: entry.created_at,
            payload: serde_json::to_value(&entry).unwrap_or_default(),
        }
    }

    fn entry_from_document(doc: &Document) -> Result<MemoryEntry> {
        Ok(serde_json::from_value(doc.payload.clone())?)
    }

    /// Bounded exponential backoff around one document write.
    async fn put_with_retry(&self, doc: Document) -> std::result::Result<(), (u32, StorageError)> {
        let mut delay_ms = self.retry.base_delay_ms;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.docs.put(doc.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= self.retry.max_attempts => return Err((attempt, e)),
                Err(e) => {
                    debug!(attempt, error = %e, "document write failed, backing off");
                    tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                    delay_ms = delay_ms.saturating_mul(2);
                }
            }
        }
    }

    /// Persist an entry, converting retry exhaustion into
    /// `StorageUnavailable` plus a missed-write event.
    async fn persist_entry(&self, entry: &MemoryEntry) -> Result<()> {
        let doc = self.entry_document(entry);
        match self.put_with_retry(doc).await {
            Ok(()) => Ok(()),
            Err((attempts, source)) => {
                obs::emit_missed_write("entries", &entry.id.0, &source);
                METRICS.inc_missed_writes();
                self.bus.emit(EngineEvent::MissedWrite {
                    collection: "entries".to_string(),
                    id: entry.id.0.clone(),
                    reason: source.to_string(),
                });
                Err(EngineError::StorageUnavailable { attempts, source })
            }
        }
    }

    /// Persist without failing the caller; touch/reward refreshes tolerate a
    /// flaky backend.
    async fn persist_entry_best_effort(&self, entry: &MemoryEntry) {
        if let Err(e) = self.persist_entry(entry).await {
            warn!(id = %entry.id, error = %e, "deferred entry refresh not persisted");
        }
    }

    async fn delete_doc_best_effort(&self, collection: Collection, id: &str) {
        if let Err(e) = self.docs.delete(collection, &DocId(id.to_string())).await {
            warn!(id, error = %e, "stale document not removed");
        }
    }

    // -- create / read / query ----------------------------------------------

    /// Store a new entry. Registers it with the utility scorer and emits
    /// `EntryCreated`. A draft without an explicit TTL inherits the
    /// configured TTL of its stratum.
    pub async fn store(&self, mut draft: EntryDraft) -> Result<EntryId> {
        let now = self.clock.now();
        if draft.expires_at.is_none() {
            draft.expires_at = self
                .ttls
                .for_stratum(draft.stratum)
                .map(|secs| now + Duration::seconds(secs as i64));
        }

        let entry = MemoryEntry::from_draft(draft, self.gate.initial_weight(), now);
        let id = entry.id.clone();

        // Persist first: a write the backend never saw is a dropped write,
        // not a half-stored entry.
        self.persist_entry(&entry).await?;

        self.scorer.register(&id);
        let stratum = entry.stratum;
        let agent_id = entry.source.agent_id.clone();
        obs::emit_entry_created(&id.0, stratum, entry.importance);

        let mut state = self.state.write().await;
        state.insert(entry);
        drop(state);

        METRICS.inc_entries_created();
        self.bus.emit(EngineEvent::EntryCreated {
            id: id.clone(),
            stratum,
            agent_id,
        });
        Ok(id)
    }

    /// Fetch one entry, recording the access.
    pub async fn get(&self, id: &EntryId) -> Result<MemoryEntry> {
        let now = self.clock.now();
        let touched = {
            let mut state = self.state.write().await;
            let entry = state
                .entries
                .get_mut(id)
                .ok_or_else(|| EngineError::NotFound { id: id.to_string() })?;
            entry.touch(now);
            entry.clone()
        };
        self.persist_entry_best_effort(&touched).await;
        Ok(touched)
    }

    /// Query one stratum with a conjunctive filter.
    ///
    /// Ordered descending by `(importance, retention weight)`, ties broken
    /// by most recent access. Every returned entry counts as retrieved.
    pub async fn query(&self, stratum: Stratum, filter: &EntryFilter) -> Result<Vec<MemoryEntry>> {
        let now = self.clock.now();
        let results = {
            let mut state = self.state.write().await;
            let ids: Vec<EntryId> = state
                .by_stratum
                .get(&stratum)
                .map(|ids| ids.iter().cloned().collect())
                .unwrap_or_default();

            let mut matched: Vec<(f64, MemoryEntry)> = Vec::new();
            for id in ids {
                let Some(entry) = state.entries.get(&id) else {
                    continue;
                };
                if !filter.matches(entry) {
                    continue;
                }
                let weight = self.gate.compute_weight(entry, now);
                matched.push((weight, entry.clone()));
            }

            matched.sort_by(|(wa, a), (wb, b)| {
                b.importance
                    .cmp(&a.importance)
                    .then_with(|| wb.partial_cmp(wa).unwrap_or(std::cmp::Ordering::Equal))
                    .then_with(|| b.last_accessed_at.cmp(&a.last_accessed_at))
            });

            let mut results = Vec::with_capacity(matched.len());
            for (_, entry) in matched {
                if let Some(live) = state.entries.get_mut(&entry.id) {
                    live.touch(now);
                    results.push(live.clone());
                }
            }
            results
        };

        for entry in &results {
            self.persist_entry_best_effort(entry).await;
        }
        Ok(results)
    }

    /// Snapshot of every live entry (analytics).
    pub async fn snapshot(&self) -> Vec<MemoryEntry> {
        let state = self.state.read().await;
        let mut entries: Vec<_> = state.entries.values().cloned().collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        entries
    }

    /// Live entry count per stratum.
    pub async fn counts(&self) -> BTreeMap<Stratum, usize> {
        let state = self.state.read().await;
        Stratum::all()
            .into_iter()
            .map(|s| {
                (
                    s,
                    state.by_stratum.get(&s).map(BTreeSet::len).unwrap_or(0),
                )
            })
            .collect()
    }

    // -- placement ----------------------------------------------------------

    /// Promote an entry toward Semantic. The target must be strictly older.
    pub async fn promote(&self, id: &EntryId, target: Stratum) -> Result<EntryId> {
        self.move_entry(id, target, MoveKind::Promote).await
    }

    /// Demote an entry toward Working. The target must be strictly newer.
    pub async fn demote(&self, id: &EntryId, target: Stratum) -> Result<EntryId> {
        self.move_entry(id, target, MoveKind::Demote).await
    }

    async fn move_entry(&self, id: &EntryId, target: Stratum, kind: MoveKind) -> Result<EntryId> {
        let now = self.clock.now();

        let source = {
            let state = self.state.read().await;
            let entry = state
                .entries
                .get(id)
                .ok_or_else(|| EngineError::NotFound { id: id.to_string() })?;
            let legal = match kind {
                MoveKind::Promote => target > entry.stratum,
                MoveKind::Demote => target < entry.stratum,
            };
            if !legal {
                return Err(EngineError::InvalidTransition {
                    from: entry.stratum,
                    to: target,
                });
            }
            entry.clone()
        };

        let mut replacement = source.clone();
        replacement.id = EntryId::new();
        replacement.stratum = target;
        replacement.related.insert(source.id.clone());
        replacement.expires_at = self
            .ttls
            .for_stratum(target)
            .map(|secs| now + Duration::seconds(secs as i64));
        self.gate.reanchor(&mut replacement, now);

        // Carry learned utility across the placement change.
        let q = self.scorer.q(&source.id);
        self.scorer
            .register_with(&replacement.id, q.unwrap_or(source.utility));

        // Persist the replacement before touching the index: a failure here
        // leaves the source untouched.
        if let Err(e) = self.persist_entry(&replacement).await {
            self.scorer.forget(&replacement.id);
            return Err(e);
        }

        let new_id = replacement.id.clone();
        {
            let mut state = self.state.write().await;
            if state.remove(&source.id).is_none() {
                // Lost a race with a concurrent delete; roll the copy back.
                drop(state);
                self.delete_doc_best_effort(Collection::Entries, &new_id.0).await;
                self.scorer.forget(&new_id);
                return Err(EngineError::NotFound { id: id.to_string() });
            }
            state.insert(replacement);
        }

        self.delete_doc_best_effort(Collection::Entries, &source.id.0)
            .await;
        self.scorer.forget(&source.id);

        obs::emit_entry_moved(&source.id.0, &new_id.0, source.stratum, target);
        match kind {
            MoveKind::Promote => {
                METRICS.inc_promotions();
                self.bus.emit(EngineEvent::EntryPromoted {
                    from_id: source.id,
                    new_id: new_id.clone(),
                    from: source.stratum,
                    to: target,
                });
            }
            MoveKind::Demote => {
                METRICS.inc_demotions();
                self.bus.emit(EngineEvent::EntryDemoted {
                    from_id: source.id,
                    new_id: new_id.clone(),
                    from: source.stratum,
                    to: target,
                });
            }
        }
        Ok(new_id)
    }

    /// Remove a superseded entry without touching lineage sets. Returns
    /// whether it was still live.
    async fn remove_superseded(&self, id: &EntryId) -> bool {
        let removed = {
            let mut state = self.state.write().await;
            state.remove(id)
        };
        match removed {
            Some(_) => {
                self.delete_doc_best_effort(Collection::Entries, &id.0).await;
                self.scorer.forget(id);
                true
            }
            None => false,
        }
    }

    /// Delete an entry and cascade it out of every `related` set.
    pub async fn delete(&self, id: &EntryId) -> Result<()> {
        let (removed, dirty) = {
            let mut state = self.state.write().await;
            let removed = state
                .remove(id)
                .ok_or_else(|| EngineError::NotFound { id: id.to_string() })?;

            let mut dirty = Vec::new();
            for entry in state.entries.values_mut() {
                if entry.related.remove(id) {
                    dirty.push(entry.clone());
                }
            }
            (removed, dirty)
        };

        self.delete_doc_best_effort(Collection::Entries, &removed.id.0)
            .await;
        for entry in &dirty {
            self.persist_entry_best_effort(entry).await;
        }
        self.scrub_surprise_references(id).await;
        self.scorer.forget(id);
        self.bus.emit(EngineEvent::EntryDeleted { id: id.clone() });
        Ok(())
    }

    /// Purge cascade into the surprise audit trail: drop records whose
    /// produced entry was explicitly deleted. Best-effort.
    async fn scrub_surprise_references(&self, id: &EntryId) {
        let records = match self.docs.query(&DocQuery::all(Collection::Surprises)).await {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "surprise cascade skipped; retried next purge");
                return;
            }
        };
        for doc in records {
            let produced = doc
                .payload
                .get("produced_entry")
                .and_then(serde_json::Value::as_str);
            if produced == Some(id.0.as_str()) {
                self.delete_doc_best_effort(Collection::Surprises, &doc.id.0)
                    .await;
            }
        }
    }

    // -- rewards ------------------------------------------------------------

    /// Refresh retention for the given entries: multiply initial weight
    /// (capped at 1) and reset the decay clock.
    pub async fn apply_reward(&self, ids: &[EntryId], multiplier: f64) -> Result<()> {
        let now = self.clock.now();
        let mut dirty = Vec::with_capacity(ids.len());
        {
            let mut state = self.state.write().await;
            for id in ids {
                let entry = state
                    .entries
                    .get_mut(id)
                    .ok_or_else(|| EngineError::NotFound { id: id.to_string() })?;
                self.gate.apply_reward(entry, multiplier, now);
                dirty.push(entry.clone());
            }
        }
        for entry in &dirty {
            self.persist_entry_best_effort(entry).await;
        }
        Ok(())
    }

    // -- sweep --------------------------------------------------------------

    /// Pressure toward consolidation: Episodic entries created since the
    /// last `reset_episodic_pressure`.
    pub async fn episodic_pressure(&self) -> usize {
        self.state.read().await.episodic_pressure
    }

    pub async fn reset_episodic_pressure(&self) {
        self.state.write().await.episodic_pressure = 0;
    }

    /// One sweep pass: expire, demote, promote.
    ///
    /// With a compressor, promotion candidates from the same stratum are
    /// clustered and rewritten into compressed replacements; without one,
    /// each candidate moves up a level with its content intact. Moved
    /// entries re-anchor to the neutral initial weight, which makes a
    /// second sweep with no intervening writes a no-op.
    pub async fn sweep(&self, compressor: Option<&MemoryCompressor>) -> Result<SweepReport> {
        let now = self.clock.now();
        let mut report = SweepReport::default();

        // TTL expiry at the persistence layer first; mirror removals here.
        match self.docs.expire_due(now).await {
            Ok(expired_docs) => {
                let mut state = self.state.write().await;
                for doc_id in expired_docs {
                    let entry_id = EntryId(doc_id.0);
                    if let Some(entry) = state.remove(&entry_id) {
                        self.scorer.forget(&entry_id);
                        METRICS.inc_expirations();
                        self.bus.emit(EngineEvent::EntryExpired {
                            id: entry_id.clone(),
                            stratum: entry.stratum,
                        });
                        report.outcome.expired.push(entry_id);
                    }
                }
            }
            Err(e) => warn!(error = %e, "TTL expiry pass failed; retrying next sweep"),
        }

        // Classify the survivors.
        let (to_delete, to_demote, to_promote) = {
            let state = self.state.read().await;
            let mut to_delete = Vec::new();
            let mut to_demote = Vec::new();
            let mut to_promote: BTreeMap<Stratum, Vec<EntryId>> = BTreeMap::new();
            for entry in state.entries.values() {
                match self.gate.classify(entry, now) {
                    SweepAction::Delete => to_delete.push(entry.id.clone()),
                    SweepAction::Demote => to_demote.push((entry.id.clone(), entry.stratum)),
                    SweepAction::Promote => to_promote
                        .entry(entry.stratum)
                        .or_default()
                        .push(entry.id.clone()),
                    SweepAction::Keep => {}
                }
            }
            (to_delete, to_demote, to_promote)
        };

        for id in to_delete {
            let stratum = {
                let state = self.state.read().await;
                state.entries.get(&id).map(|e| e.stratum)
            };
            if self.delete(&id).await.is_ok() {
                METRICS.inc_expirations();
                if let Some(stratum) = stratum {
                    self.bus.emit(EngineEvent::EntryExpired {
                        id: id.clone(),
                        stratum,
                    });
                }
                report.outcome.expired.push(id);
            }
        }

        for (id, stratum) in to_demote {
            let Some(target) = stratum.demoted() else {
                continue;
            };
            match self.move_entry(&id, target, MoveKind::Demote).await {
                Ok(new_id) => report.outcome.demoted.push((id, new_id)),
                Err(e) => warn!(id = %id, error = %e, "sweep demotion skipped"),
            }
        }

        for (stratum, ids) in to_promote {
            let Some(target) = stratum.promoted() else {
                continue;
            };
            match compressor {
                None => {
                    for id in ids {
                        match self.move_entry(&id, target, MoveKind::Promote).await {
                            Ok(new_id) => report.outcome.promoted.push((id, new_id)),
                            Err(e) => warn!(id = %id, error = %e, "sweep promotion skipped"),
                        }
                    }
                }
                Some(compressor) => {
                    self.promote_compressed(&ids, stratum, target, compressor, &mut report)
                        .await;
                }
            }
        }

        obs::emit_sweep_finished(
            report.outcome.promoted.len(),
            report.outcome.demoted.len(),
            report.outcome.expired.len(),
        );
        Ok(report)
    }

    /// Cluster-and-compress promotion used by the outer loop.
    async fn promote_compressed(
        &self,
        ids: &[EntryId],
        source: Stratum,
        target: Stratum,
        compressor: &MemoryCompressor,
        report: &mut SweepReport,
    ) {
        let now = self.clock.now();
        let members: Vec<MemoryEntry> = {
            let state = self.state.read().await;
            ids.iter()
                .filter_map(|id| state.entries.get(id).cloned())
                .collect()
        };
        if members.is_empty() {
            return;
        }

        let outputs = match compressor.compress(&members, target, now) {
            Ok(outputs) => outputs,
            Err(e) => {
                warn!(stratum = %source, error = %e, "compression failed; promoting uncompressed");
                for id in ids {
                    if let Ok(new_id) = self.move_entry(id, target, MoveKind::Promote).await {
                        report.outcome.promoted.push((id.clone(), new_id));
                    }
                }
                return;
            }
        };

        for mut output in outputs {
            let inputs: Vec<EntryId> = output.draft.related.iter().cloned().collect();
            let new_id = match self.store(output.draft).await {
                Ok(id) => id,
                Err(e) => {
                    warn!(error = %e, "compressed replacement not stored; inputs kept");
                    continue;
                }
            };

            // Patterns outlive their superseded inputs through the
            // compressed replacement.
            for pattern in &mut output.patterns {
                pattern.related.insert(new_id.clone());
            }

            // Inputs are superseded by the compressed replacement. Removal
            // must not cascade: the replacement's lineage keeps their ids.
            for input in inputs {
                if self.remove_superseded(&input).await {
                    METRICS.inc_promotions();
                    self.bus.emit(EngineEvent::EntryPromoted {
                        from_id: input.clone(),
                        new_id: new_id.clone(),
                        from: source,
                        to: target,
                    });
                    report.outcome.promoted.push((input, new_id.clone()));
                }
            }
            report.patterns.extend(output.patterns);
        }
    }

    // -- surprise & pattern documents ---------------------------------------

    /// Persist a write-once surprise audit row with its TTL.
    pub async fn record_surprise(&self, record: &SurpriseRecord) -> Result<()> {
        let doc = Document {
            id: DocId(record.id.clone()),
            collection: Collection::Surprises,
            owner: Some(record.agent_id.clone()),
            channel: None,
            stratum: None,
            tags: Vec::new(),
            importance: None,
            last_accessed_at: None,
            expires_at: Some(record.expires_at),
            created_at: record.recorded_at,
            payload: serde_json::to_value(record)?,
        };
        match self.put_with_retry(doc).await {
            Ok(()) => {
                METRICS.inc_surprises_recorded();
                Ok(())
            }
            Err((attempts, source)) => {
                obs::emit_missed_write("surprises", &record.id, &source);
                METRICS.inc_missed_writes();
                self.bus.emit(EngineEvent::MissedWrite {
                    collection: "surprises".to_string(),
                    id: record.id.clone(),
                    reason: source.to_string(),
                });
                Err(EngineError::StorageUnavailable { attempts, source })
            }
        }
    }

    /// All persisted surprise scores (analytics).
    pub async fn surprise_scores(&self) -> Result<Vec<f64>> {
        let docs = self
            .docs
            .query(&DocQuery::all(Collection::Surprises))
            .await?;
        Ok(docs
            .iter()
            .filter_map(|d| d.payload.get("score").and_then(serde_json::Value::as_f64))
            .collect())
    }

    async fn put_pattern_doc(&self, pattern: &MemoryPattern) -> Result<()> {
        let doc = Document {
            id: DocId(pattern.id.0.clone()),
            collection: Collection::Patterns,
            owner: None,
            channel: None,
            stratum: None,
            tags: Vec::new(),
            importance: None,
            last_accessed_at: None,
            expires_at: None,
            created_at: pattern.detected_at,
            payload: serde_json::to_value(pattern)?,
        };
        self.put_with_retry(doc).await.map_err(|(attempts, source)| {
            obs::emit_missed_write("patterns", &pattern.id.0, &source);
            METRICS.inc_missed_writes();
            EngineError::StorageUnavailable { attempts, source }
        })
    }

    /// Register a newly detected pattern (outer loop only).
    pub async fn record_pattern(&self, pattern: &MemoryPattern) -> Result<()> {
        self.put_pattern_doc(pattern).await?;
        METRICS.inc_patterns_detected();
        self.bus.emit(EngineEvent::PatternDetected {
            id: pattern.id.clone(),
            kind: pattern.kind,
            frequency: pattern.frequency,
        });
        Ok(())
    }

    /// All persisted patterns.
    pub async fn patterns(&self) -> Result<Vec<MemoryPattern>> {
        let docs = self.docs.query(&DocQuery::all(Collection::Patterns)).await?;
        let mut patterns = Vec::with_capacity(docs.len());
        for doc in docs {
            patterns.push(serde_json::from_value(doc.payload)?);
        }
        Ok(patterns)
    }

    /// Remove dangling entry references from pattern records; patterns with
    /// no surviving references are dropped. Runs inside consolidation so a
    /// purge cascade completes within one cycle.
    pub async fn prune_pattern_references(&self) -> Result<usize> {
        let live: BTreeSet<EntryId> = {
            let state = self.state.read().await;
            state.entries.keys().cloned().collect()
        };

        let mut pruned = 0usize;
        for mut pattern in self.patterns().await? {
            let before = pattern.related.len();
            pattern.related.retain(|id| live.contains(id));
            if pattern.related.is_empty() {
                self.delete_doc_best_effort(Collection::Patterns, &pattern.id.0)
                    .await;
                pruned += 1;
            } else if pattern.related.len() != before {
                pattern.updated_at = self.clock.now();
                self.put_pattern_doc(&pattern).await?;
                pruned += 1;
            }
        }
        Ok(pruned)
    }

    // -- startup ------------------------------------------------------------

    /// Load every persisted entry into the in-memory arena, registering
    /// utilities with the scorer. Returns the number hydrated.
    pub async fn hydrate(&self) -> Result<usize> {
        let docs = self.docs.query(&DocQuery::all(Collection::Entries)).await?;
        let mut count = 0usize;
        let mut state = self.state.write().await;
        for doc in &docs {
            match Self::entry_from_document(doc) {
                Ok(entry) => {
                    self.scorer.register_with(&entry.id, entry.utility);
                    state.insert(entry);
                    count += 1;
                }
                Err(e) => warn!(id = %doc.id, error = %e, "skipping undecodable entry document"),
            }
        }
        state.episodic_pressure = 0;
        debug!(count, "hydrated entries from document store");
        Ok(count)
    }
}
