//! Solver/Verifier mode transitions and the bounded self-repair protocol,
//! driven through the full engine surface.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use stratum_core::store::EntryFilter;
use stratum_core::{
    ActionOutcome, ActionRunner, CancelFlag, CycleEvent, EngineConfig, EngineError, EngineEvent,
    Mode, Outcome, Patch, Phase, RepairOutcome, RetentionEngine, Stratum,
};

/// Runner whose Act phase fails with low confidence until a scripted patch
/// attempt verifies (or never, when `verifies_on` is None).
struct FlakyRunner {
    verifies_on: Option<u32>,
    patches: AtomicU32,
}

impl FlakyRunner {
    fn failing_until(attempt: u32) -> Self {
        Self {
            verifies_on: Some(attempt),
            patches: AtomicU32::new(0),
        }
    }

    fn hopeless() -> Self {
        Self {
            verifies_on: None,
            patches: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl ActionRunner for FlakyRunner {
    async fn run(&self, _agent_id: &str, _plan: &str) -> ActionOutcome {
        ActionOutcome {
            success: false,
            retry_count: 3,
            detail: "verification mismatch: expected healthy, got degraded".into(),
        }
    }

    async fn apply_patch(&self, _agent_id: &str, _patch: &Patch) -> bool {
        let n = self.patches.fetch_add(1, Ordering::SeqCst) + 1;
        self.verifies_on == Some(n)
    }
}

fn event(description: &str) -> CycleEvent {
    CycleEvent {
        agent_id: "agent-1".into(),
        channel_id: "chan-1".into(),
        cycle: 1,
        phase: Phase::Observe,
        expected: Outcome::Label("healthy".into()),
        actual: Outcome::Label("degraded".into()),
        description: description.into(),
        tags: BTreeSet::from(["ops".to_string()]),
    }
}

#[tokio::test]
async fn act_failure_triggers_verifier_then_recovers() {
    let engine = RetentionEngine::in_memory(EngineConfig::default());
    let mut events = engine.subscribe();
    let runner = FlakyRunner::failing_until(1);

    let report = engine
        .observe_cycle(event("restart the gateway"), &runner, &CancelFlag::new())
        .await
        .unwrap();

    assert_eq!(report.repair, Some(RepairOutcome::Repaired));
    assert_eq!(report.mode_after, Mode::Solver);

    // Corrected reasoning is a LongTerm entry tagged self-repair.
    let repaired = engine
        .retrieve(
            Stratum::LongTerm,
            &EntryFilter::any().with_tag("self-repair"),
            Phase::Reflect,
        )
        .await
        .unwrap();
    assert_eq!(repaired.len(), 1);

    // Mode events: Solver -> Verifier -> Solver, plus a patch application.
    let mut modes = Vec::new();
    let mut patches = 0;
    while let Ok(ev) = events.try_recv() {
        match ev {
            EngineEvent::ModeChanged { mode, .. } => modes.push(mode),
            EngineEvent::PatchApplied { .. } => patches += 1,
            _ => {}
        }
    }
    assert_eq!(modes, vec![Mode::Verifier, Mode::Solver]);
    assert_eq!(patches, 1);
}

#[tokio::test]
async fn three_failed_patches_exhaust_self_repair() {
    let engine = RetentionEngine::in_memory(EngineConfig::default());
    let mut events = engine.subscribe();
    let runner = FlakyRunner::hopeless();

    let err = engine
        .observe_cycle(event("doomed migration"), &runner, &CancelFlag::new())
        .await
        .unwrap_err();

    match err {
        EngineError::SelfRepairExhausted { attempts, .. } => assert_eq!(attempts, 3),
        other => panic!("expected SelfRepairExhausted, got {other}"),
    }
    assert_eq!(
        runner.patches.load(Ordering::SeqCst),
        3,
        "the attempt cap is the exact number of patches tried"
    );

    let mut saw_exhausted = false;
    while let Ok(ev) = events.try_recv() {
        if let EngineEvent::SelfRepairExhausted { attempts, .. } = ev {
            saw_exhausted = true;
            assert_eq!(attempts, 3);
        }
    }
    assert!(saw_exhausted, "exhaustion event emitted for collaborators");
}

#[tokio::test]
async fn later_verification_still_bounded_by_cap() {
    let engine = RetentionEngine::in_memory(EngineConfig::default());
    // Verifies on attempt 3: the last permitted one.
    let runner = FlakyRunner::failing_until(3);

    let report = engine
        .observe_cycle(event("slow fix"), &runner, &CancelFlag::new())
        .await
        .unwrap();
    assert_eq!(report.repair, Some(RepairOutcome::Repaired));
    assert_eq!(runner.patches.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn repair_failure_does_not_poison_the_next_cycle() {
    let engine = RetentionEngine::in_memory(EngineConfig::default());

    let hopeless = FlakyRunner::hopeless();
    let _ = engine
        .observe_cycle(event("first try"), &hopeless, &CancelFlag::new())
        .await
        .unwrap_err();

    // A healthy runner afterwards completes a clean Solver cycle.
    struct HealthyRunner;
    #[async_trait]
    impl ActionRunner for HealthyRunner {
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

    let report = engine
        .observe_cycle(event("second try"), &HealthyRunner, &CancelFlag::new())
        .await
        .unwrap();
    assert!(report.repair.is_none());
    assert_eq!(report.cycle, 2);
}
