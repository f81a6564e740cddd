//! Release controller — drives every slot through the transition table.
//!
//! Each slot has one async lock; every transition reads the slot, computes
//! a [`ChangeSet`] and commits it under that lock, then publishes a fresh
//! route snapshot. Benchmarks run with the lock released so operator
//! commands can cancel them; the result is only applied if the slot is
//! still benchmarking the same candidate when it arrives.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use modelgate_bench::{
    BenchError, BenchPair, BenchResult, BenchmarkRunner, Corpus, ReportedMetrics, ScorableModel,
    Scorer,
};
use modelgate_core::{system_clock, Clock, SlotConfig, SlotId, VersionId};
use modelgate_metrics::{render_prometheus, render_report, MetricsAggregator, Recorded};
use modelgate_monitor::{CandidateDetected, VersionMonitor, VersionSource};
use modelgate_router::{RouteError, TrafficRouter};
use modelgate_state::{
    AbTestSession, ChangeSet, DecisionNote, ModelSlot, RollbackWindow, SlotState, StateStore,
    Variant, VersionRecord, VersionStatus,
};

use crate::error::{ControlError, ControlResult};
use crate::machine::{next_state, Transition};
use crate::policy::{conclude_ab, decide, decide_bootstrap, quality_score, AbConclusion, Decision};
use crate::rollback::{alarm_tripped, RollbackManager};

/// Slot plus everything an operator needs to see alongside it.
#[derive(Debug, Clone, Serialize)]
pub struct SlotStatus {
    #[serde(flatten)]
    pub slot: ModelSlot,
    pub ab_session: Option<AbTestSession>,
    pub rollback_window: Option<RollbackWindow>,
    pub pending_candidates: Vec<VersionId>,
}

/// What one benchmark step decided.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepOutcome {
    pub version_id: VersionId,
    pub outcome: String,
    pub reason: String,
}

/// Result of an operator-triggered version check.
#[derive(Debug, Clone, Serialize)]
pub struct CheckReport {
    pub slot_id: SlotId,
    pub detected: Vec<VersionId>,
}

/// Where a reported outcome landed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutcomeAck {
    pub version_id: VersionId,
    /// `variant_a`, `variant_b`, `watch` or `ignored`.
    pub recorded: &'static str,
}

struct InFlight {
    version: VersionId,
    cancel: watch::Sender<bool>,
}

struct SlotRuntime {
    config: SlotConfig,
    runner: BenchmarkRunner,
    corpus: parking_lot::Mutex<Option<Arc<Corpus>>>,
    lock: tokio::sync::Mutex<()>,
    in_flight: parking_lot::Mutex<Option<InFlight>>,
    workers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

struct Inner {
    state: StateStore,
    router: TrafficRouter,
    metrics: Arc<MetricsAggregator>,
    monitor: VersionMonitor,
    rollback: RollbackManager,
    slots: BTreeMap<SlotId, SlotRuntime>,
    corpus_dir: PathBuf,
    clock: Clock,
}

/// Follow-up work a timer step hands back once the slot lock is released.
enum FollowUp {
    None,
    Advance,
    Rollback(String),
}

pub struct ControllerBuilder {
    state: StateStore,
    source: Arc<dyn VersionSource>,
    router: TrafficRouter,
    metrics: Arc<MetricsAggregator>,
    scorer: Arc<dyn Scorer>,
    clock: Clock,
    corpus_dir: PathBuf,
    slots: Vec<(SlotConfig, Arc<dyn ScorableModel>, Option<Corpus>)>,
}

impl ControllerBuilder {
    pub fn router(mut self, router: TrafficRouter) -> Self {
        self.router = router;
        self
    }

    pub fn metrics(mut self, metrics: Arc<MetricsAggregator>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn scorer(mut self, scorer: Arc<dyn Scorer>) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Directory holding `{slot_type}.json` benchmark corpora.
    pub fn corpus_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.corpus_dir = dir.into();
        self
    }

    pub fn slot(mut self, config: SlotConfig, model: Arc<dyn ScorableModel>) -> Self {
        self.slots.push((config, model, None));
        self
    }

    /// Register a slot whose corpus is already in memory.
    pub fn slot_with_corpus(
        mut self,
        config: SlotConfig,
        model: Arc<dyn ScorableModel>,
        corpus: Corpus,
    ) -> Self {
        self.slots.push((config, model, Some(corpus)));
        self
    }

    pub fn build(self) -> Controller {
        let slot_ids: Vec<SlotId> = self.slots.iter().map(|(c, _, _)| c.slot_id.clone()).collect();
        let monitor = VersionMonitor::new(self.state.clone(), Arc::clone(&self.source), slot_ids)
            .with_clock(Arc::clone(&self.clock));
        let slots = self
            .slots
            .into_iter()
            .map(|(config, model, corpus)| {
                let runtime = SlotRuntime {
                    runner: BenchmarkRunner::new(model, Arc::clone(&self.scorer)),
                    corpus: parking_lot::Mutex::new(corpus.map(Arc::new)),
                    lock: tokio::sync::Mutex::new(()),
                    in_flight: parking_lot::Mutex::new(None),
                    workers: parking_lot::Mutex::new(Vec::new()),
                    config,
                };
                (runtime.config.slot_id.clone(), runtime)
            })
            .collect();
        Controller {
            inner: Arc::new(Inner {
                state: self.state,
                router: self.router,
                metrics: self.metrics,
                monitor,
                rollback: RollbackManager::new(self.source),
                slots,
                corpus_dir: self.corpus_dir,
                clock: self.clock,
            }),
        }
    }
}

#[derive(Clone)]
pub struct Controller {
    inner: Arc<Inner>,
}

impl Controller {
    pub fn builder(state: StateStore, source: Arc<dyn VersionSource>) -> ControllerBuilder {
        ControllerBuilder {
            state,
            source,
            router: TrafficRouter::new(),
            metrics: Arc::new(MetricsAggregator::new()),
            scorer: Arc::new(ReportedMetrics),
            clock: system_clock(),
            corpus_dir: PathBuf::from("corpus"),
            slots: Vec::new(),
        }
    }

    pub fn state(&self) -> &StateStore {
        &self.inner.state
    }

    pub fn router(&self) -> &TrafficRouter {
        &self.inner.router
    }

    pub fn metrics(&self) -> &Arc<MetricsAggregator> {
        &self.inner.metrics
    }

    pub fn slot_ids(&self) -> Vec<SlotId> {
        self.inner.slots.keys().cloned().collect()
    }

    fn now(&self) -> u64 {
        (self.inner.clock)()
    }

    fn runtime(&self, slot_id: &str) -> ControlResult<&SlotRuntime> {
        self.inner
            .slots
            .get(slot_id)
            .ok_or_else(|| ControlError::NotFound(format!("slot {slot_id}")))
    }

    fn load_slot(&self, slot_id: &str) -> ControlResult<ModelSlot> {
        self.inner
            .state
            .get_slot(slot_id)?
            .ok_or_else(|| ControlError::NotFound(format!("slot {slot_id}")))
    }

    fn load_version(&self, slot_id: &str, version_id: &str) -> ControlResult<VersionRecord> {
        self.inner
            .state
            .get_version(slot_id, version_id)?
            .ok_or_else(|| ControlError::NotFound(format!("version {slot_id}/{version_id}")))
    }

    fn publish(&self, rt: &SlotRuntime, slot: &ModelSlot, session: Option<&AbTestSession>) {
        self.inner.router.publish_slot(slot, session);
    }

    // ── startup ──────────────────────────────────────────────────

    /// Reconcile persisted state with the configured slots, publish route
    /// snapshots, and queue any pending candidates.
    ///
    /// A benchmark interrupted by a restart counts as an incomplete
    /// attempt, and its slot is left for the retry interval instead of
    /// being queued now. Open A/B sessions and rollback windows resume with
    /// their persisted deadlines.
    pub async fn start(&self) -> ControlResult<()> {
        let mut deferred = Vec::new();
        for (slot_id, rt) in &self.inner.slots {
            if self.recover_slot(slot_id, rt).await? {
                deferred.push(slot_id.clone());
            }
        }
        for slot_id in self.inner.slots.keys() {
            if !deferred.contains(slot_id) {
                self.spawn_advance(slot_id);
            }
        }
        info!(
            slots = self.inner.slots.len(),
            deferred = deferred.len(),
            "release controller started"
        );
        Ok(())
    }

    /// Returns `true` when an interrupted benchmark was found.
    async fn recover_slot(&self, slot_id: &str, rt: &SlotRuntime) -> ControlResult<bool> {
        let _guard = rt.lock.lock().await;
        let now = self.now();
        let state = &self.inner.state;
        let mut changes = ChangeSet::new();

        let (mut slot, mut dirty) = match state.get_slot(slot_id)? {
            Some(slot) => (slot, false),
            None => {
                info!(slot = %slot_id, "registering slot");
                (ModelSlot::new(slot_id, now), true)
            }
        };

        if slot.active_version_id.is_none()
            && let Some(version) = &rt.config.bootstrap_version
        {
            let mut record = state
                .get_version(slot_id, version)?
                .unwrap_or_else(|| VersionRecord::candidate(slot_id, version, "bootstrap", now));
            record.status = VersionStatus::Active;
            record.activated_at = Some(now);
            record.signaled = true;
            record.decision = Some(note("bootstrap", "configured bootstrap version", None, now));
            slot.active_version_id = Some(version.clone());
            dirty = true;
            info!(slot = %slot_id, version = %version, "bootstrapped active version");
            changes = changes.version(record);
        }

        let mut session = None;
        let mut interrupted = false;
        match slot.state {
            SlotState::Idle => {}
            SlotState::Benchmarking => {
                interrupted = true;
                if let Some(candidate) = slot.candidate_version_id.take()
                    && let Some(mut record) = state.get_version(slot_id, &candidate)?
                {
                    let rejected = mark_incomplete(
                        &mut record,
                        rt.config.benchmark.max_attempts,
                        "interrupted by restart",
                        now,
                    );
                    warn!(slot = %slot_id, version = %candidate, rejected, "benchmark interrupted by restart");
                    changes = changes.version(record);
                }
                slot.state = SlotState::Idle;
                dirty = true;
            }
            SlotState::AbTesting => match state.open_ab_session(slot_id)? {
                Some(open) => {
                    self.inner.metrics.begin_session(&open);
                    info!(slot = %slot_id, ends_at = open.ends_at, "resumed A/B test");
                    session = Some(open);
                }
                None => {
                    warn!(slot = %slot_id, "A/B state without an open session; reverting candidate");
                    if let Some(candidate) = slot.candidate_version_id.take()
                        && let Some(mut record) = state.get_version(slot_id, &candidate)?
                    {
                        record.status = VersionStatus::Candidate;
                        changes = changes.version(record);
                    }
                    slot.state = SlotState::Idle;
                    dirty = true;
                }
            },
            SlotState::RollbackWindowOpen => match state.get_rollback_window(slot_id)? {
                Some(window) if !window.is_expired(now) => {
                    self.inner.metrics.watch(slot_id, &window.promoted_version);
                }
                Some(_) => {
                    info!(slot = %slot_id, "rollback window expired while stopped");
                    slot.state = next_state(slot.state, Transition::ExpireWindow)?;
                    changes = changes.close_window(slot_id);
                    dirty = true;
                }
                None => {
                    slot.state = SlotState::Idle;
                    dirty = true;
                }
            },
        }

        // Detected before the restart but never handed to the controller.
        let touched: Vec<VersionId> = changes.versions.iter().map(|v| v.version_id.clone()).collect();
        for mut record in state.list_candidates(slot_id)? {
            if record.signaled || touched.contains(&record.version_id) {
                continue;
            }
            debug!(slot = %slot_id, version = %record.version_id, "re-signalling candidate");
            record.signaled = true;
            changes = changes.version(record);
        }

        if dirty {
            slot.updated_at = now;
            changes = changes.slot(slot.clone());
        }
        if !changes.is_empty() {
            state.commit(&changes)?;
        }
        self.publish(rt, &slot, session.as_ref());
        Ok(interrupted)
    }

    // ── candidate pipeline ───────────────────────────────────────

    /// Consume one detection event.
    pub async fn handle_candidate(
        &self,
        event: CandidateDetected,
    ) -> ControlResult<Option<StepOutcome>> {
        let rt = self.runtime(&event.slot_id)?;
        {
            let _guard = rt.lock.lock().await;
            if let Some(mut record) = self.inner.state.get_version(&event.slot_id, &event.version_id)?
                && !record.signaled
            {
                record.signaled = true;
                self.inner.state.put_version(&record)?;
            }
        }
        self.advance(&event.slot_id).await
    }

    /// Benchmark the oldest queued candidate if the slot is idle.
    ///
    /// Returns `None` when the slot is busy or nothing is queued.
    pub async fn advance(&self, slot_id: &str) -> ControlResult<Option<StepOutcome>> {
        let rt = self.runtime(slot_id)?;
        let Some((candidate, active, cancel)) = self.begin_benchmark(slot_id, rt).await? else {
            return Ok(None);
        };

        let outcome = match self.corpus_for(rt) {
            Ok(corpus) => {
                rt.runner
                    .run_pair(
                        slot_id,
                        active.as_deref(),
                        &candidate,
                        &corpus,
                        &rt.config.benchmark,
                        self.now(),
                        cancel,
                    )
                    .await
            }
            Err(e) => Err(e),
        };
        let step = self.finish_benchmark(slot_id, rt, &candidate, outcome).await?;
        // A rejection leaves the slot idle; move on to the next queued candidate.
        // Incomplete runs wait for the next retry so they are not re-run back to back.
        if step.as_ref().is_some_and(|s| s.outcome == "reject") {
            self.spawn_advance(slot_id);
        }
        Ok(step)
    }

    async fn begin_benchmark(
        &self,
        slot_id: &str,
        rt: &SlotRuntime,
    ) -> ControlResult<Option<(VersionId, Option<VersionId>, watch::Receiver<bool>)>> {
        let _guard = rt.lock.lock().await;
        let mut slot = self.load_slot(slot_id)?;
        if slot.state != SlotState::Idle {
            debug!(slot = %slot_id, state = ?slot.state, "slot busy; candidate stays queued");
            return Ok(None);
        }
        let Some(mut record) = self.next_candidate(slot_id)? else {
            return Ok(None);
        };
        let now = self.now();

        slot.state = next_state(slot.state, Transition::BeginBenchmark)?;
        slot.candidate_version_id = Some(record.version_id.clone());
        slot.updated_at = now;
        record.status = VersionStatus::Testing;
        record.signaled = true;

        self.inner
            .state
            .commit(&ChangeSet::new().slot(slot.clone()).version(record.clone()))?;
        self.publish(rt, &slot, None);

        let (tx, rx) = watch::channel(false);
        *rt.in_flight.lock() = Some(InFlight {
            version: record.version_id.clone(),
            cancel: tx,
        });
        info!(
            slot = %slot_id,
            candidate = %record.version_id,
            active = ?slot.active_version_id,
            "benchmark started"
        );
        Ok(Some((record.version_id, slot.active_version_id, rx)))
    }

    /// Next queued candidate: fewest benchmark attempts, then detection
    /// time, then upstream release time.
    fn next_candidate(&self, slot_id: &str) -> ControlResult<Option<VersionRecord>> {
        let mut candidates = self.inner.state.list_candidates(slot_id)?;
        candidates.sort_by(|a, b| {
            let key = |r: &VersionRecord| {
                (
                    r.benchmark_attempts,
                    r.detected_at,
                    r.available_at.unwrap_or(u64::MAX),
                    r.version_id.clone(),
                )
            };
            key(a).cmp(&key(b))
        });
        Ok(candidates.into_iter().next())
    }

    fn corpus_for(&self, rt: &SlotRuntime) -> BenchResult<Arc<Corpus>> {
        if let Some(corpus) = rt.corpus.lock().as_ref() {
            return Ok(Arc::clone(corpus));
        }
        let corpus = Arc::new(Corpus::load(&self.inner.corpus_dir, &rt.config.slot_type)?);
        *rt.corpus.lock() = Some(Arc::clone(&corpus));
        Ok(corpus)
    }

    async fn finish_benchmark(
        &self,
        slot_id: &str,
        rt: &SlotRuntime,
        candidate: &str,
        outcome: BenchResult<BenchPair>,
    ) -> ControlResult<Option<StepOutcome>> {
        let _guard = rt.lock.lock().await;
        {
            let mut in_flight = rt.in_flight.lock();
            if in_flight.as_ref().is_some_and(|f| f.version == candidate) {
                *in_flight = None;
            }
        }

        let slot = self.load_slot(slot_id)?;
        if slot.state != SlotState::Benchmarking
            || slot.candidate_version_id.as_deref() != Some(candidate)
        {
            debug!(slot = %slot_id, version = %candidate, "slot moved on; benchmark result discarded");
            return Ok(None);
        }
        let mut record = self.load_version(slot_id, candidate)?;
        let now = self.now();
        let cfg = &rt.config;

        let pair = match outcome {
            Ok(pair) => pair,
            Err(BenchError::Cancelled) => {
                let mut next = slot.clone();
                next.state = next_state(slot.state, Transition::Cancel)?;
                next.candidate_version_id = None;
                next.updated_at = now;
                record.status = VersionStatus::Candidate;
                self.inner
                    .state
                    .commit(&ChangeSet::new().slot(next.clone()).version(record))?;
                self.publish(rt, &next, None);
                return Ok(Some(StepOutcome {
                    version_id: candidate.to_string(),
                    outcome: "cancelled".into(),
                    reason: "benchmark cancelled".into(),
                }));
            }
            Err(e) => {
                let reason = e.to_string();
                let rejected = mark_incomplete(&mut record, cfg.benchmark.max_attempts, &reason, now);
                let mut next = slot.clone();
                next.state = next_state(slot.state, Transition::Reject)?;
                next.candidate_version_id = None;
                next.updated_at = now;
                warn!(
                    slot = %slot_id,
                    version = %candidate,
                    attempts = record.benchmark_attempts,
                    rejected,
                    reason = %reason,
                    "benchmark incomplete"
                );
                self.inner
                    .state
                    .commit(&ChangeSet::new().slot(next.clone()).version(record))?;
                self.publish(rt, &next, None);
                return Ok(Some(StepOutcome {
                    version_id: candidate.to_string(),
                    outcome: "benchmark_incomplete".into(),
                    reason,
                }));
            }
        };

        record.quality_score = quality_score(&cfg.policy, &pair.candidate.metrics);
        let mut changes = ChangeSet::new().benchmark(pair.candidate.clone());
        if let Some(active_result) = &pair.active {
            changes = changes.benchmark(active_result.clone());
            if let Some(active_id) = &slot.active_version_id {
                let mut active = self.load_version(slot_id, active_id)?;
                if active.quality_score.is_none() {
                    active.quality_score = quality_score(&cfg.policy, &active_result.metrics);
                    changes = changes.version(active);
                }
            }
        }

        let decision = match &pair.active {
            Some(active) => decide(&cfg.policy, active, &pair.candidate),
            None => decide_bootstrap(&cfg.policy, &pair.candidate),
        };
        info!(
            slot = %slot_id,
            version = %candidate,
            decision = decision.label(),
            score = ?record.quality_score,
            reason = %decision.reason(),
            "benchmark decided"
        );
        let compared_to = slot.active_version_id.clone();

        let (next, session) = match &decision {
            Decision::Reject(reason) => {
                record.status = VersionStatus::Rejected;
                record.decision = Some(note("reject", reason, compared_to, now));
                let mut next = slot.clone();
                next.state = next_state(slot.state, Transition::Reject)?;
                next.candidate_version_id = None;
                next.updated_at = now;
                changes = changes.slot(next.clone()).version(record);
                (next, None)
            }
            Decision::Promote(reason) => {
                let (next, promotion) = self.plan_promotion(
                    cfg,
                    &slot,
                    record,
                    |windowed| Transition::Promote { windowed },
                    "promote",
                    reason,
                    now,
                )?;
                changes = merge(changes, promotion);
                (next, None)
            }
            Decision::RunAbTest(reason) => {
                let Some(active) = slot.active_version_id.clone() else {
                    return Err(ControlError::invalid(format!(
                        "slot {slot_id} has no active version to test against"
                    )));
                };
                let session = AbTestSession::new(
                    slot_id,
                    &active,
                    candidate,
                    cfg.ab_test.traffic_split,
                    now,
                    cfg.ab_test.duration_secs,
                );
                record.decision = Some(note("ab_test", reason, compared_to, now));
                let mut next = slot.clone();
                next.state = next_state(slot.state, Transition::BeginAbTest)?;
                next.updated_at = now;
                changes = changes
                    .slot(next.clone())
                    .version(record)
                    .ab_session(session.clone());
                (next, Some(session))
            }
        };

        self.inner.state.commit(&changes)?;
        self.after_commit(rt, &next, session.as_ref());

        Ok(Some(StepOutcome {
            version_id: candidate.to_string(),
            outcome: decision.label().to_string(),
            reason: decision.reason().to_string(),
        }))
    }

    /// Make `record` the active version of `slot`.
    ///
    /// The outgoing version is retired and kept restorable for the
    /// slot's rollback window. A slot's first version opens no window.
    #[allow(clippy::too_many_arguments)]
    fn plan_promotion(
        &self,
        cfg: &SlotConfig,
        slot: &ModelSlot,
        mut record: VersionRecord,
        transition: impl Fn(bool) -> Transition,
        outcome: &str,
        reason: &str,
        now: u64,
    ) -> ControlResult<(ModelSlot, ChangeSet)> {
        let previous = slot
            .active_version_id
            .clone()
            .filter(|p| *p != record.version_id);
        let windowed = previous.is_some();

        let mut next = slot.clone();
        next.state = next_state(slot.state, transition(windowed))?;
        next.active_version_id = Some(record.version_id.clone());
        next.candidate_version_id = None;
        next.updated_at = now;

        record.status = VersionStatus::Active;
        record.activated_at = Some(now);
        record.retire_at = None;
        record.decision = Some(note(outcome, reason, previous.clone(), now));

        let mut changes = ChangeSet::new().version(record.clone());
        match previous {
            Some(previous) => {
                let mut outgoing = self.load_version(&slot.slot_id, &previous)?;
                outgoing.status = VersionStatus::Retired;
                outgoing.retire_at = Some(now + cfg.rollback.window_secs);
                changes = changes.version(outgoing).open_window(RollbackWindow {
                    slot_id: slot.slot_id.clone(),
                    promoted_version: record.version_id.clone(),
                    previous_version: previous,
                    opened_at: now,
                    expires_at: now + cfg.rollback.window_secs,
                });
            }
            None => changes = changes.close_window(&slot.slot_id),
        }
        info!(
            slot = %slot.slot_id,
            version = %record.version_id,
            outcome,
            windowed,
            "version promoted"
        );
        Ok((next.clone(), changes.slot(next)))
    }

    /// Sync the aggregator and router with a committed slot.
    fn after_commit(&self, rt: &SlotRuntime, slot: &ModelSlot, session: Option<&AbTestSession>) {
        let metrics = &self.inner.metrics;
        match slot.state {
            SlotState::AbTesting => {
                if let Some(session) = session {
                    metrics.begin_session(session);
                }
            }
            SlotState::RollbackWindowOpen => {
                if let Some(active) = &slot.active_version_id {
                    metrics.watch(&slot.slot_id, active);
                }
            }
            _ => metrics.unwatch(&slot.slot_id),
        }
        self.publish(rt, slot, session);
    }

    /// Run `advance` in the background for `slot_id`.
    pub fn spawn_advance(&self, slot_id: &str) {
        let Some(rt) = self.inner.slots.get(slot_id) else {
            return;
        };
        let controller = self.clone();
        let slot = slot_id.to_string();
        let handle = tokio::spawn(async move {
            if let Err(e) = controller.advance(&slot).await {
                error!(slot = %slot, error = %e, "advance failed");
            }
        });
        let mut workers = rt.workers.lock();
        workers.retain(|h| !h.is_finished());
        workers.push(handle);
    }

    fn spawn_candidate(&self, event: CandidateDetected) {
        let Some(rt) = self.inner.slots.get(&event.slot_id) else {
            warn!(slot = %event.slot_id, "candidate event for unknown slot");
            return;
        };
        let controller = self.clone();
        let handle = tokio::spawn(async move {
            let slot = event.slot_id.clone();
            if let Err(e) = controller.handle_candidate(event).await {
                error!(slot = %slot, error = %e, "candidate handling failed");
            }
        });
        let mut workers = rt.workers.lock();
        workers.retain(|h| !h.is_finished());
        workers.push(handle);
    }

    /// Wait for every background step spawned for `slot_id`.
    pub async fn settle(&self, slot_id: &str) {
        let Some(rt) = self.inner.slots.get(slot_id) else {
            return;
        };
        loop {
            let pending: Vec<JoinHandle<()>> = rt.workers.lock().drain(..).collect();
            if pending.is_empty() {
                return;
            }
            for handle in pending {
                let _ = handle.await;
            }
        }
    }

    // ── timers ───────────────────────────────────────────────────

    /// Evaluate deadlines for every slot: conclude or extend A/B tests,
    /// expire rollback windows, and check the quality alarm.
    pub async fn tick(&self) {
        for slot_id in self.inner.slots.keys() {
            match self.tick_slot(slot_id).await {
                Ok(FollowUp::None) => {}
                Ok(FollowUp::Advance) => self.spawn_advance(slot_id),
                Ok(FollowUp::Rollback(reason)) => {
                    if let Err(e) = self.rollback_with_reason(slot_id, &reason).await {
                        error!(slot = %slot_id, error = %e, "automatic rollback failed");
                    }
                }
                Err(e) => error!(slot = %slot_id, error = %e, "tick failed"),
            }
        }
    }

    async fn tick_slot(&self, slot_id: &str) -> ControlResult<FollowUp> {
        let rt = self.runtime(slot_id)?;
        let _guard = rt.lock.lock().await;
        let slot = self.load_slot(slot_id)?;
        let now = self.now();
        match slot.state {
            SlotState::AbTesting => self.tick_ab(rt, slot, now),
            SlotState::RollbackWindowOpen => self.tick_window(rt, slot, now),
            SlotState::Idle | SlotState::Benchmarking => Ok(FollowUp::None),
        }
    }

    fn tick_ab(&self, rt: &SlotRuntime, slot: ModelSlot, now: u64) -> ControlResult<FollowUp> {
        let slot_id = slot.slot_id.clone();
        let cfg = &rt.config;
        let Some(mut session) = self.inner.state.open_ab_session(&slot_id)? else {
            warn!(slot = %slot_id, "A/B state without an open session; reverting candidate");
            let mut next = slot.clone();
            next.state = next_state(slot.state, Transition::Cancel)?;
            next.candidate_version_id = None;
            next.updated_at = now;
            let mut changes = ChangeSet::new().slot(next.clone());
            if let Some(candidate) = &slot.candidate_version_id {
                let mut record = self.load_version(&slot_id, candidate)?;
                record.status = VersionStatus::Candidate;
                changes = changes.version(record);
            }
            self.inner.state.commit(&changes)?;
            self.after_commit(rt, &next, None);
            return Ok(FollowUp::Advance);
        };

        let metrics = &self.inner.metrics;
        let snapshot = match metrics.snapshot(&slot_id) {
            Some(s) if s.started_at == session.started_at => s,
            _ => {
                metrics.begin_session(&session);
                metrics
                    .snapshot(&slot_id)
                    .ok_or_else(|| ControlError::invalid(format!("no aggregates for {slot_id}")))?
            }
        };
        session.per_variant_metrics = snapshot.per_variant.clone();

        if now < session.ends_at {
            self.inner.state.put_ab_session(&session)?;
            return Ok(FollowUp::None);
        }

        let primary = &cfg.ab_test.primary_metric;
        let a = snapshot.stats(Variant::A, primary);
        let b = snapshot.stats(Variant::B, primary);
        match conclude_ab(&cfg.ab_test, &a, &b, session.extended) {
            AbConclusion::InsufficientData => {
                session.ends_at = now + cfg.ab_test.extension_secs();
                session.extended = true;
                warn!(
                    slot = %slot_id,
                    samples_a = a.count,
                    samples_b = b.count,
                    min = cfg.ab_test.min_samples_per_variant,
                    ends_at = session.ends_at,
                    "insufficient A/B data; extending test once"
                );
                self.inner.state.put_ab_session(&session)?;
                self.publish(rt, &slot, Some(&session));
                Ok(FollowUp::None)
            }
            AbConclusion::Winner { variant, reason } => {
                session.closed_at = Some(now);
                session.winner = Some(session.version_for(variant).to_string());
                session.conclusion = Some(reason.clone());
                let record = self.load_version(&slot_id, &session.variant_b_version)?;
                info!(
                    slot = %slot_id,
                    winner = %session.version_for(variant),
                    reason = %reason,
                    "A/B test concluded"
                );

                let (next, changes) = match variant {
                    Variant::B => self.plan_promotion(
                        cfg,
                        &slot,
                        record,
                        |windowed| Transition::Promote { windowed },
                        "ab_promote",
                        &reason,
                        now,
                    )?,
                    Variant::A => {
                        let mut record = record;
                        record.status = VersionStatus::Rejected;
                        record.decision = Some(note(
                            "ab_keep",
                            &reason,
                            Some(session.variant_a_version.clone()),
                            now,
                        ));
                        let mut next = slot.clone();
                        next.state = next_state(slot.state, Transition::KeepIncumbent)?;
                        next.candidate_version_id = None;
                        next.updated_at = now;
                        (next.clone(), ChangeSet::new().slot(next).version(record))
                    }
                };
                self.inner.state.commit(&changes.ab_session(session))?;
                metrics.end_session(&slot_id);
                self.after_commit(rt, &next, None);
                Ok(if next.state == SlotState::Idle {
                    FollowUp::Advance
                } else {
                    FollowUp::None
                })
            }
        }
    }

    fn tick_window(&self, rt: &SlotRuntime, slot: ModelSlot, now: u64) -> ControlResult<FollowUp> {
        let slot_id = slot.slot_id.clone();
        let Some(window) = self.inner.state.get_rollback_window(&slot_id)? else {
            warn!(slot = %slot_id, "window state without a rollback window");
            let mut next = slot;
            next.state = SlotState::Idle;
            next.updated_at = now;
            self.inner.state.put_slot(&next)?;
            self.after_commit(rt, &next, None);
            return Ok(FollowUp::Advance);
        };

        if let Some((next, changes)) = self.inner.rollback.plan_expiry(&slot, &window, now)? {
            self.inner.state.commit(&changes)?;
            self.after_commit(rt, &next, None);
            info!(
                slot = %slot_id,
                version = %window.promoted_version,
                "rollback window expired"
            );
            return Ok(FollowUp::Advance);
        }

        if let Some(alarm) = &rt.config.rollback.alarm
            && let Some(watched) = self.inner.metrics.watch_snapshot(&slot_id)
            && watched.version == window.promoted_version
            && let Some(reason) = alarm_tripped(alarm, &watched)
        {
            warn!(slot = %slot_id, version = %watched.version, reason = %reason, "quality alarm tripped");
            return Ok(FollowUp::Rollback(reason));
        }
        Ok(FollowUp::None)
    }

    // ── operator commands ────────────────────────────────────────

    /// Poll the feed for `slot_id` now and queue anything new.
    pub async fn force_check(&self, slot_id: &str) -> ControlResult<CheckReport> {
        self.runtime(slot_id)?;
        let created = self.inner.monitor.detect(slot_id).await?;
        let detected: Vec<VersionId> = created.into_iter().map(|r| r.version_id).collect();
        info!(slot = %slot_id, detected = detected.len(), "forced version check");
        self.spawn_advance(slot_id);
        Ok(CheckReport {
            slot_id: slot_id.to_string(),
            detected,
        })
    }

    /// Make `version_id` active immediately, aborting whatever is in flight.
    pub async fn force_promote(&self, slot_id: &str, version_id: &str) -> ControlResult<SlotStatus> {
        let rt = self.runtime(slot_id)?;
        {
            let _guard = rt.lock.lock().await;
            let slot = self.load_slot(slot_id)?;
            let record = self.load_version(slot_id, version_id)?;
            if slot.active_version_id.as_deref() == Some(version_id) {
                debug!(slot = %slot_id, version = %version_id, "already active");
                return self.status(slot_id);
            }
            let now = self.now();
            cancel_in_flight(rt);

            let mut extra = ChangeSet::new();
            if let Some(candidate) = &slot.candidate_version_id
                && slot.state.in_flight()
                && candidate != version_id
            {
                let mut displaced = self.load_version(slot_id, candidate)?;
                displaced.status = VersionStatus::Candidate;
                extra = extra.version(displaced);
            }
            if slot.state == SlotState::AbTesting
                && let Some(mut session) = self.inner.state.open_ab_session(slot_id)?
            {
                if let Some(snapshot) = self.inner.metrics.end_session(slot_id) {
                    session.per_variant_metrics = snapshot.per_variant;
                }
                session.closed_at = Some(now);
                session.winner = Some(version_id.to_string());
                session.conclusion = Some("force_promote".to_string());
                extra = extra.ab_session(session);
            }

            let (next, changes) = self.plan_promotion(
                &rt.config,
                &slot,
                record,
                |windowed| Transition::ForcePromote { windowed },
                "force_promote",
                "operator promotion",
                now,
            )?;
            self.inner.state.commit(&merge(extra, changes))?;
            self.after_commit(rt, &next, None);
        }
        self.status(slot_id)
    }

    /// Mark `version_id` rejected, aborting its benchmark or A/B test.
    pub async fn force_reject(&self, slot_id: &str, version_id: &str) -> ControlResult<SlotStatus> {
        let rt = self.runtime(slot_id)?;
        let released = {
            let _guard = rt.lock.lock().await;
            let slot = self.load_slot(slot_id)?;
            let mut record = self.load_version(slot_id, version_id)?;
            if slot.active_version_id.as_deref() == Some(version_id) {
                return Err(ControlError::invalid(format!(
                    "{version_id} is the active version of {slot_id}; roll back instead"
                )));
            }
            if record.status == VersionStatus::Rejected {
                return self.status(slot_id);
            }
            if let Some(window) = self.inner.state.get_rollback_window(slot_id)?
                && window.previous_version == version_id
            {
                return Err(ControlError::invalid(format!(
                    "{version_id} is the rollback target of {slot_id}"
                )));
            }
            let now = self.now();
            let mut changes = ChangeSet::new();

            let in_flight = slot.state.in_flight()
                && slot.candidate_version_id.as_deref() == Some(version_id);
            let mut next = slot.clone();
            if in_flight {
                cancel_in_flight(rt);
                if slot.state == SlotState::AbTesting
                    && let Some(mut session) = self.inner.state.open_ab_session(slot_id)?
                {
                    if let Some(snapshot) = self.inner.metrics.end_session(slot_id) {
                        session.per_variant_metrics = snapshot.per_variant;
                    }
                    session.closed_at = Some(now);
                    session.winner = Some(session.variant_a_version.clone());
                    session.conclusion = Some("force_reject".to_string());
                    changes = changes.ab_session(session);
                }
                next.state = next_state(slot.state, Transition::Cancel)?;
                next.candidate_version_id = None;
                next.updated_at = now;
                changes = changes.slot(next.clone());
            }

            record.status = VersionStatus::Rejected;
            record.decision = Some(note(
                "force_reject",
                "operator rejection",
                slot.active_version_id.clone(),
                now,
            ));
            self.inner.state.commit(&changes.version(record))?;
            info!(slot = %slot_id, version = %version_id, in_flight, "version rejected by operator");
            if in_flight {
                self.after_commit(rt, &next, None);
            }
            in_flight
        };
        if released {
            self.spawn_advance(slot_id);
        }
        self.status(slot_id)
    }

    /// Operator rollback to the version the open window can restore.
    pub async fn rollback(&self, slot_id: &str) -> ControlResult<SlotStatus> {
        self.rollback_with_reason(slot_id, "operator rollback").await
    }

    async fn rollback_with_reason(&self, slot_id: &str, reason: &str) -> ControlResult<SlotStatus> {
        let rt = self.runtime(slot_id)?;
        let slot = self.load_slot(slot_id)?;
        let Some(window) = self.inner.state.get_rollback_window(slot_id)? else {
            return self.rollback_already_applied(&slot);
        };

        // Servability is a feed round trip; check it before taking the lock.
        self.inner
            .rollback
            .ensure_servable(slot_id, &window.previous_version)
            .await?;

        {
            let _guard = rt.lock.lock().await;
            let slot = self.load_slot(slot_id)?;
            let Some(current) = self.inner.state.get_rollback_window(slot_id)? else {
                return self.rollback_already_applied(&slot);
            };
            if current.previous_version != window.previous_version {
                return Err(ControlError::invalid(format!(
                    "rollback window for {slot_id} changed; retry"
                )));
            }
            let promoted = self.load_version(slot_id, &current.promoted_version)?;
            let previous = self.load_version(slot_id, &current.previous_version)?;
            let now = self.now();
            let (next, changes) = self
                .inner
                .rollback
                .plan_rollback(&slot, &current, &promoted, &previous, reason, now)?;
            self.inner.state.commit(&changes)?;
            self.after_commit(rt, &next, None);
            warn!(
                slot = %slot_id,
                from = %current.promoted_version,
                to = %current.previous_version,
                reason = %reason,
                "rolled back"
            );
        }
        self.spawn_advance(slot_id);
        self.status(slot_id)
    }

    /// A repeated rollback is a no-op; otherwise there is nothing to restore.
    fn rollback_already_applied(&self, slot: &ModelSlot) -> ControlResult<SlotStatus> {
        if let Some(last) = &slot.last_rollback
            && slot.active_version_id.as_deref() == Some(last.to_version.as_str())
            && slot.state != SlotState::RollbackWindowOpen
        {
            debug!(slot = %slot.slot_id, version = %last.to_version, "rollback already applied");
            return self.status(&slot.slot_id);
        }
        Err(ControlError::invalid(format!(
            "slot {} has no open rollback window",
            slot.slot_id
        )))
    }

    // ── reads ────────────────────────────────────────────────────

    pub fn status(&self, slot_id: &str) -> ControlResult<SlotStatus> {
        self.runtime(slot_id)?;
        let slot = self.load_slot(slot_id)?;
        let state = &self.inner.state;
        let mut ab_session = state.open_ab_session(slot_id)?;
        if let Some(session) = ab_session.as_mut()
            && let Some(snapshot) = self.inner.metrics.snapshot(slot_id)
            && snapshot.started_at == session.started_at
        {
            session.per_variant_metrics = snapshot.per_variant;
        }
        let pending_candidates = state
            .list_candidates(slot_id)?
            .into_iter()
            .map(|r| r.version_id)
            .collect();
        Ok(SlotStatus {
            ab_session,
            rollback_window: state.get_rollback_window(slot_id)?,
            pending_candidates,
            slot,
        })
    }

    pub fn list_status(&self) -> ControlResult<Vec<SlotStatus>> {
        self.inner.slots.keys().map(|id| self.status(id)).collect()
    }

    pub fn history(&self, slot_id: &str) -> ControlResult<Vec<VersionRecord>> {
        self.runtime(slot_id)?;
        Ok(self.inner.state.list_versions(slot_id)?)
    }

    pub fn report(&self, slot_id: &str) -> ControlResult<String> {
        let slot = self.load_slot(slot_id)?;
        let history = self.history(slot_id)?;
        Ok(render_report(&slot, &history))
    }

    pub fn prometheus(&self) -> ControlResult<String> {
        let state = &self.inner.state;
        let slots = state.list_slots()?;
        let mut versions = Vec::new();
        for slot in &slots {
            versions.extend(state.list_versions(&slot.slot_id)?);
        }
        Ok(render_prometheus(&slots, &versions, &self.inner.metrics.snapshots()))
    }

    /// Fold one serving outcome into the slot's A/B test or alarm watch.
    ///
    /// Without an explicit `version_id` the session key is routed the same
    /// way the serving path routed it.
    pub fn record_outcome(
        &self,
        slot_id: &str,
        session_key: &str,
        version_id: Option<&str>,
        metrics: &BTreeMap<String, f64>,
    ) -> ControlResult<OutcomeAck> {
        self.runtime(slot_id)?;
        let version_id = match version_id {
            Some(v) => v.to_string(),
            None => self
                .inner
                .router
                .route(slot_id, session_key)
                .map_err(|e| match e {
                    RouteError::UnknownSlot(_) => ControlError::NotFound(e.to_string()),
                    RouteError::NoActiveVersion(_) => ControlError::invalid(e.to_string()),
                })?,
        };
        let recorded = match self.inner.metrics.record(slot_id, &version_id, metrics) {
            Recorded::Variant(Variant::A) => "variant_a",
            Recorded::Variant(Variant::B) => "variant_b",
            Recorded::Watch => "watch",
            Recorded::Ignored => "ignored",
        };
        Ok(OutcomeAck {
            version_id,
            recorded,
        })
    }

    // ── main loop ────────────────────────────────────────────────

    /// Consume detection events and drive timers until `shutdown` flips.
    ///
    /// Every `retry_interval` each slot is nudged so candidates queued
    /// behind an earlier transition, or returned after an incomplete
    /// benchmark, get picked up.
    pub async fn run(
        &self,
        mut events: mpsc::Receiver<CandidateDetected>,
        tick_interval: Duration,
        retry_interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut retry = tokio::time::interval(retry_interval);
        retry.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first retry tick fires immediately; start() already queued every
        // slot that was not interrupted mid-benchmark.
        retry.tick().await;

        info!(
            tick_secs = tick_interval.as_secs(),
            retry_secs = retry_interval.as_secs(),
            "controller loop started"
        );
        loop {
            tokio::select! {
                Some(event) = events.recv() => self.spawn_candidate(event),
                _ = ticker.tick() => self.tick().await,
                _ = retry.tick() => {
                    for slot_id in self.inner.slots.keys() {
                        self.spawn_advance(slot_id);
                    }
                }
                _ = shutdown.changed() => {
                    info!("controller shutting down");
                    for rt in self.inner.slots.values() {
                        cancel_in_flight(rt);
                    }
                    return;
                }
            }
        }
    }
}

fn note(outcome: &str, reason: &str, compared_to: Option<VersionId>, at: u64) -> DecisionNote {
    DecisionNote {
        outcome: outcome.to_string(),
        reason: reason.to_string(),
        compared_to,
        at,
    }
}

/// Count an incomplete benchmark. Returns `true` once attempts are exhausted
/// and the record has been rejected; otherwise it is re-queued.
fn mark_incomplete(record: &mut VersionRecord, max_attempts: u32, reason: &str, now: u64) -> bool {
    record.benchmark_attempts += 1;
    let rejected = record.benchmark_attempts >= max_attempts;
    record.status = if rejected {
        VersionStatus::Rejected
    } else {
        VersionStatus::Candidate
    };
    record.decision = Some(note(
        "benchmark_incomplete",
        &format!(
            "{reason} (attempt {}/{max_attempts})",
            record.benchmark_attempts
        ),
        None,
        now,
    ));
    rejected
}

fn cancel_in_flight(rt: &SlotRuntime) {
    if let Some(in_flight) = rt.in_flight.lock().take() {
        debug!(version = %in_flight.version, "cancelling in-flight benchmark");
        let _ = in_flight.cancel.send(true);
    }
}

/// Append `b` to `a`. Later version writes win; `b`'s slot and window
/// changes replace `a`'s.
fn merge(a: ChangeSet, b: ChangeSet) -> ChangeSet {
    let mut out = a;
    out.versions.extend(b.versions);
    out.benchmarks.extend(b.benchmarks);
    out.ab_sessions.extend(b.ab_sessions);
    if b.slot.is_some() {
        out.slot = b.slot;
    }
    if b.open_window.is_some() {
        out.open_window = b.open_window;
    }
    if b.close_window.is_some() {
        out.close_window = b.close_window;
    }
    out
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use async_trait::async_trait;
    use serde_json::json;

    use modelgate_bench::{ModelOutput, Sample};
    use modelgate_core::metric::{FID, PSNR_DB, QUALITY_SCORE};
    use modelgate_monitor::FeedEntry;

    use super::*;

    #[derive(Default)]
    struct Feed {
        entries: parking_lot::Mutex<Vec<FeedEntry>>,
    }

    #[async_trait]
    impl VersionSource for Feed {
        async fn fetch(&self, _slot_id: &str) -> anyhow::Result<Vec<FeedEntry>> {
            Ok(self.entries.lock().clone())
        }
    }

    /// Reports fixed metrics per version; unknown versions fail.
    #[derive(Default)]
    struct Model {
        metrics: parking_lot::Mutex<HashMap<String, BTreeMap<String, f64>>>,
        gate: parking_lot::Mutex<Option<Arc<tokio::sync::Notify>>>,
    }

    impl Model {
        fn set(&self, version: &str, psnr: f64, fid: f64) {
            self.metrics.lock().insert(
                version.to_string(),
                BTreeMap::from([(PSNR_DB.to_string(), psnr), (FID.to_string(), fid)]),
            );
        }
    }

    #[async_trait]
    impl ScorableModel for Model {
        async fn invoke(&self, version_id: &str, _sample: &Sample) -> anyhow::Result<ModelOutput> {
            let gate = self.gate.lock().clone();
            if let Some(gate) = gate {
                gate.notified().await;
            }
            let metrics = self
                .metrics
                .lock()
                .get(version_id)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("unknown version {version_id}"))?;
            Ok(ModelOutput {
                output: json!({}),
                metrics,
                latency_ms: Some(10.0),
            })
        }
    }

    struct Harness {
        controller: Controller,
        feed: Arc<Feed>,
        model: Arc<Model>,
        clock: Arc<AtomicU64>,
    }

    fn harness(mut cfg: SlotConfig) -> Harness {
        cfg.benchmark.sample_count = 4;
        let feed = Arc::new(Feed::default());
        let model = Arc::new(Model::default());
        let clock = Arc::new(AtomicU64::new(1_000));
        let tick = Arc::clone(&clock);
        let samples = (0..4)
            .map(|i| Sample {
                id: format!("s{i}"),
                input: json!({ "prompt": i }),
                reference: None,
            })
            .collect();
        let controller = Controller::builder(
            StateStore::open_in_memory().unwrap(),
            Arc::clone(&feed) as Arc<dyn VersionSource>,
        )
        .clock(Arc::new(move || tick.load(Ordering::SeqCst)))
        .slot_with_corpus(
            cfg,
            Arc::clone(&model) as Arc<dyn ScorableModel>,
            Corpus::new("image_generation", samples),
        )
        .build();
        Harness {
            controller,
            feed,
            model,
            clock,
        }
    }

    fn slot_cfg() -> SlotConfig {
        let mut cfg = SlotConfig::new("img", "image_generation");
        cfg.bootstrap_version = Some("v1".into());
        cfg
    }

    impl Harness {
        async fn detect(&self, versions: &[&str]) {
            *self.feed.entries.lock() = versions.iter().map(|v| FeedEntry::new(v)).collect();
            self.controller.force_check("img").await.unwrap();
            self.controller.settle("img").await;
        }

        fn advance_clock(&self, secs: u64) {
            self.clock.fetch_add(secs, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn start_bootstraps_active_version() {
        let h = harness(slot_cfg());
        h.controller.start().await.unwrap();
        h.controller.settle("img").await;

        let status = h.controller.status("img").unwrap();
        assert_eq!(status.slot.active_version_id.as_deref(), Some("v1"));
        assert_eq!(status.slot.state, SlotState::Idle);
        assert_eq!(h.controller.router().route("img", "user-1").unwrap(), "v1");
        let v1 = h.controller.state().get_version("img", "v1").unwrap().unwrap();
        assert_eq!(v1.status, VersionStatus::Active);
    }

    #[tokio::test]
    async fn improvement_promotes_and_opens_window() {
        let h = harness(slot_cfg());
        h.model.set("v1", 30.0, 20.0);
        h.model.set("v2", 34.0, 18.0);
        h.controller.start().await.unwrap();
        h.detect(&["v2"]).await;

        let status = h.controller.status("img").unwrap();
        assert_eq!(status.slot.active_version_id.as_deref(), Some("v2"));
        assert_eq!(status.slot.state, SlotState::RollbackWindowOpen);
        let window = status.rollback_window.unwrap();
        assert_eq!(window.previous_version, "v1");

        let v1 = h.controller.state().get_version("img", "v1").unwrap().unwrap();
        assert_eq!(v1.status, VersionStatus::Retired);
        assert_eq!(v1.retire_at, Some(window.expires_at));
        let v2 = h.controller.state().get_version("img", "v2").unwrap().unwrap();
        assert!(v2.quality_score.is_some());
        assert_eq!(h.controller.router().route("img", "anyone").unwrap(), "v2");
    }

    #[tokio::test]
    async fn second_force_check_is_a_noop() {
        let h = harness(slot_cfg());
        h.model.set("v1", 30.0, 20.0);
        h.model.set("v2", 34.0, 18.0);
        h.controller.start().await.unwrap();

        *h.feed.entries.lock() = vec![FeedEntry::new("v2")];
        let first = h.controller.force_check("img").await.unwrap();
        h.controller.settle("img").await;
        let second = h.controller.force_check("img").await.unwrap();
        h.controller.settle("img").await;

        assert_eq!(first.detected, vec!["v2".to_string()]);
        assert!(second.detected.is_empty());
        assert_eq!(h.controller.history("img").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unknown_slot_is_not_found() {
        let h = harness(slot_cfg());
        h.controller.start().await.unwrap();
        assert_eq!(h.controller.force_check("nope").await.unwrap_err().code(), "not_found");
        assert_eq!(h.controller.status("nope").unwrap_err().code(), "not_found");
        assert_eq!(
            h.controller.force_promote("img", "v9").await.unwrap_err().code(),
            "not_found"
        );
    }

    #[tokio::test]
    async fn failing_benchmark_requeues_then_rejects() {
        let mut cfg = slot_cfg();
        cfg.benchmark.max_attempts = 2;
        let h = harness(cfg);
        h.model.set("v1", 30.0, 20.0);
        // v2 has no metrics, so every sample fails.
        h.controller.start().await.unwrap();
        h.detect(&["v2"]).await;

        let v2 = h.controller.state().get_version("img", "v2").unwrap().unwrap();
        assert_eq!(v2.status, VersionStatus::Candidate);
        assert_eq!(v2.benchmark_attempts, 1);
        assert_eq!(h.controller.status("img").unwrap().slot.state, SlotState::Idle);

        let step = h.controller.advance("img").await.unwrap().unwrap();
        assert_eq!(step.outcome, "benchmark_incomplete");
        let v2 = h.controller.state().get_version("img", "v2").unwrap().unwrap();
        assert_eq!(v2.status, VersionStatus::Rejected);
        assert_eq!(h.controller.status("img").unwrap().slot.active_version_id.as_deref(), Some("v1"));
    }

    #[tokio::test]
    async fn force_reject_cancels_running_benchmark() {
        let h = harness(slot_cfg());
        h.model.set("v1", 30.0, 20.0);
        h.model.set("v2", 34.0, 18.0);
        let gate = Arc::new(tokio::sync::Notify::new());
        *h.model.gate.lock() = Some(Arc::clone(&gate));
        h.controller.start().await.unwrap();

        *h.feed.entries.lock() = vec![FeedEntry::new("v2")];
        h.controller.force_check("img").await.unwrap();
        while h.controller.status("img").unwrap().slot.state != SlotState::Benchmarking {
            tokio::task::yield_now().await;
        }

        let status = h.controller.force_reject("img", "v2").await.unwrap();
        assert_eq!(status.slot.state, SlotState::Idle);
        h.controller.settle("img").await;

        let v2 = h.controller.state().get_version("img", "v2").unwrap().unwrap();
        assert_eq!(v2.status, VersionStatus::Rejected);
        assert_eq!(v2.decision.unwrap().outcome, "force_reject");
        assert_eq!(h.controller.status("img").unwrap().slot.active_version_id.as_deref(), Some("v1"));
    }

    #[tokio::test]
    async fn force_reject_refuses_active_version() {
        let h = harness(slot_cfg());
        h.controller.start().await.unwrap();
        let err = h.controller.force_reject("img", "v1").await.unwrap_err();
        assert_eq!(err.code(), "invalid_transition");
    }

    #[tokio::test]
    async fn rollback_restores_previous_and_is_idempotent() {
        let h = harness(slot_cfg());
        h.model.set("v1", 30.0, 20.0);
        h.model.set("v2", 34.0, 18.0);
        h.controller.start().await.unwrap();
        h.detect(&["v2"]).await;

        let status = h.controller.rollback("img").await.unwrap();
        assert_eq!(status.slot.active_version_id.as_deref(), Some("v1"));
        assert_eq!(status.slot.state, SlotState::Idle);
        assert!(status.rollback_window.is_none());
        assert_eq!(h.controller.router().route("img", "u").unwrap(), "v1");

        let again = h.controller.rollback("img").await.unwrap();
        assert_eq!(again.slot.active_version_id.as_deref(), Some("v1"));
        h.controller.settle("img").await;
        let v2 = h.controller.state().get_version("img", "v2").unwrap().unwrap();
        assert_eq!(v2.status, VersionStatus::Rejected);
    }

    #[tokio::test]
    async fn rollback_without_window_is_rejected() {
        let h = harness(slot_cfg());
        h.controller.start().await.unwrap();
        let err = h.controller.rollback("img").await.unwrap_err();
        assert_eq!(err.code(), "invalid_transition");
    }

    #[tokio::test]
    async fn window_expires_on_tick() {
        let h = harness(slot_cfg());
        h.model.set("v1", 30.0, 20.0);
        h.model.set("v2", 34.0, 18.0);
        h.controller.start().await.unwrap();
        h.detect(&["v2"]).await;

        h.advance_clock(48 * 3600);
        h.controller.tick().await;
        h.controller.settle("img").await;

        let status = h.controller.status("img").unwrap();
        assert_eq!(status.slot.state, SlotState::Idle);
        assert!(status.rollback_window.is_none());
        assert_eq!(h.controller.rollback("img").await.unwrap_err().code(), "invalid_transition");
    }

    #[tokio::test]
    async fn force_promote_preempts_ab_test() {
        let h = harness(slot_cfg());
        // Marginal PSNR gain with slightly worse FID goes to an A/B test.
        h.model.set("v1", 32.0, 19.0);
        h.model.set("v2", 33.0, 19.5);
        h.controller.start().await.unwrap();
        h.detect(&["v2"]).await;
        assert_eq!(h.controller.status("img").unwrap().slot.state, SlotState::AbTesting);

        *h.feed.entries.lock() = vec![FeedEntry::new("v2"), FeedEntry::new("v3")];
        h.controller.force_check("img").await.unwrap();
        h.controller.settle("img").await;
        let status = h.controller.force_promote("img", "v3").await.unwrap();
        h.controller.settle("img").await;

        assert_eq!(status.slot.active_version_id.as_deref(), Some("v3"));
        assert_eq!(status.slot.state, SlotState::RollbackWindowOpen);
        assert!(status.ab_session.is_none());
        let sessions = h.controller.state().list_ab_sessions("img").unwrap();
        assert_eq!(sessions[0].conclusion.as_deref(), Some("force_promote"));
        // The preempted candidate goes back in the queue.
        let v2 = h.controller.state().get_version("img", "v2").unwrap().unwrap();
        assert_eq!(v2.status, VersionStatus::Candidate);
    }

    #[tokio::test]
    async fn restart_recovers_interrupted_benchmark() {
        let state = StateStore::open_in_memory().unwrap();
        let mut slot = ModelSlot::new("img", 0);
        slot.active_version_id = Some("v1".into());
        slot.candidate_version_id = Some("v2".into());
        slot.state = SlotState::Benchmarking;
        let mut v1 = VersionRecord::candidate("img", "v1", "", 0);
        v1.status = VersionStatus::Active;
        let mut v2 = VersionRecord::candidate("img", "v2", "", 0);
        v2.status = VersionStatus::Testing;
        let v3 = VersionRecord::candidate("img", "v3", "", 5);
        state
            .commit(&ChangeSet::new().slot(slot).version(v1).version(v2).version(v3))
            .unwrap();

        let mut cfg = SlotConfig::new("img", "image_generation");
        cfg.benchmark.max_attempts = 1;
        let controller = Controller::builder(state.clone(), Arc::new(Feed::default()))
            .clock(Arc::new(|| 100))
            .slot_with_corpus(
                cfg,
                Arc::new(Model::default()),
                Corpus::new("image_generation", vec![]),
            )
            .build();
        controller.start().await.unwrap();
        controller.settle("img").await;

        let v2 = state.get_version("img", "v2").unwrap().unwrap();
        assert_eq!(v2.status, VersionStatus::Rejected);
        assert_eq!(v2.benchmark_attempts, 1);
        assert!(v2.decision.unwrap().reason.contains("interrupted by restart"));
        assert_eq!(state.get_slot("img").unwrap().unwrap().state, SlotState::Idle);
        let v3 = state.get_version("img", "v3").unwrap().unwrap();
        assert!(v3.signaled);
        assert_eq!(controller.router().route("img", "u").unwrap(), "v1");
    }

    /// Persist a slot caught mid-benchmark of v2 against active v1.
    fn commit_interrupted_benchmark(state: &StateStore) {
        let mut slot = ModelSlot::new("img", 0);
        slot.active_version_id = Some("v1".into());
        slot.candidate_version_id = Some("v2".into());
        slot.state = SlotState::Benchmarking;
        let mut v1 = VersionRecord::candidate("img", "v1", "", 0);
        v1.status = VersionStatus::Active;
        let mut v2 = VersionRecord::candidate("img", "v2", "", 0);
        v2.status = VersionStatus::Testing;
        v2.signaled = true;
        state
            .commit(&ChangeSet::new().slot(slot).version(v1).version(v2))
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn interrupted_candidate_waits_for_retry_tick() {
        let h = harness(slot_cfg());
        h.model.set("v1", 30.0, 20.0);
        h.model.set("v2", 34.0, 18.0);
        commit_interrupted_benchmark(h.controller.state());

        h.controller.start().await.unwrap();
        h.controller.settle("img").await;

        let v2 = h.controller.state().get_version("img", "v2").unwrap().unwrap();
        assert_eq!(v2.status, VersionStatus::Candidate);
        assert_eq!(v2.benchmark_attempts, 1);
        let slot = h.controller.status("img").unwrap().slot;
        assert_eq!(slot.state, SlotState::Idle);
        assert_eq!(slot.active_version_id.as_deref(), Some("v1"));

        let (_events_tx, events_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let controller = h.controller.clone();
        let run = tokio::spawn(async move {
            controller
                .run(
                    events_rx,
                    Duration::from_secs(3600),
                    Duration::from_secs(60),
                    shutdown_rx,
                )
                .await;
        });

        tokio::time::sleep(Duration::from_secs(30)).await;
        h.controller.settle("img").await;
        let v2 = h.controller.state().get_version("img", "v2").unwrap().unwrap();
        assert_eq!(v2.status, VersionStatus::Candidate);
        assert_eq!(v2.benchmark_attempts, 1);

        tokio::time::sleep(Duration::from_secs(40)).await;
        h.controller.settle("img").await;
        let slot = h.controller.status("img").unwrap().slot;
        assert_eq!(slot.active_version_id.as_deref(), Some("v2"));
        assert_eq!(slot.state, SlotState::RollbackWindowOpen);

        shutdown_tx.send(true).unwrap();
        run.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_cancel_requeues_without_counting_attempt() {
        let h = harness(slot_cfg());
        h.model.set("v1", 30.0, 20.0);
        h.model.set("v2", 34.0, 18.0);
        let gate = Arc::new(tokio::sync::Notify::new());
        *h.model.gate.lock() = Some(Arc::clone(&gate));
        h.controller.start().await.unwrap();

        let (_events_tx, events_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let controller = h.controller.clone();
        let run = tokio::spawn(async move {
            controller
                .run(
                    events_rx,
                    Duration::from_secs(3600),
                    Duration::from_secs(3600),
                    shutdown_rx,
                )
                .await;
        });

        *h.feed.entries.lock() = vec![FeedEntry::new("v2")];
        h.controller.force_check("img").await.unwrap();
        while h.controller.status("img").unwrap().slot.state != SlotState::Benchmarking {
            tokio::task::yield_now().await;
        }

        shutdown_tx.send(true).unwrap();
        run.await.unwrap();
        h.controller.settle("img").await;

        let v2 = h.controller.state().get_version("img", "v2").unwrap().unwrap();
        assert_eq!(v2.status, VersionStatus::Candidate);
        assert_eq!(v2.benchmark_attempts, 0);
        let slot = h.controller.status("img").unwrap().slot;
        assert_eq!(slot.state, SlotState::Idle);
        assert!(slot.candidate_version_id.is_none());
        assert_eq!(slot.active_version_id.as_deref(), Some("v1"));
    }

    #[tokio::test]
    async fn outcomes_route_to_ab_variants() {
        let mut cfg = slot_cfg();
        cfg.ab_test.traffic_split = 1.0;
        let h = harness(cfg);
        h.model.set("v1", 32.0, 19.0);
        h.model.set("v2", 33.0, 19.5);
        h.controller.start().await.unwrap();
        h.detect(&["v2"]).await;

        let outcome = BTreeMap::from([(QUALITY_SCORE.to_string(), 80.0)]);
        let ack = h.controller.record_outcome("img", "user-9", None, &outcome).unwrap();
        assert_eq!(ack.version_id, "v2");
        assert_eq!(ack.recorded, "variant_b");
        let ack = h.controller.record_outcome("img", "x", Some("v1"), &outcome).unwrap();
        assert_eq!(ack.recorded, "variant_a");
        let ack = h.controller.record_outcome("img", "x", Some("v0"), &outcome).unwrap();
        assert_eq!(ack.recorded, "ignored");

        let status = h.controller.status("img").unwrap();
        let session = status.ab_session.unwrap();
        assert_eq!(session.per_variant_metrics[&Variant::B][QUALITY_SCORE].count, 1);
    }
}
