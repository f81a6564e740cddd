//! Domain types for the modelgate state store.
//!
//! These types represent the persisted state of model slots, the version
//! history, benchmark results, A/B sessions, and rollback windows. All types
//! are serializable to/from JSON for storage in redb tables.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub use modelgate_core::{SlotId, VersionId};

// ── Slot ──────────────────────────────────────────────────────────

/// Lifecycle state of a model slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    /// Serving the active version; nothing in flight, no rollback offered.
    Idle,
    /// A candidate is being benchmarked against the active version.
    Benchmarking,
    /// Live traffic is split between the active version and the candidate.
    AbTesting,
    /// A promotion happened recently and can still be rolled back.
    RollbackWindowOpen,
}

impl SlotState {
    /// True while a benchmark or A/B test owns the slot.
    pub fn in_flight(self) -> bool {
        matches!(self, SlotState::Benchmarking | SlotState::AbTesting)
    }
}

/// A logical, independently versioned unit of generative capability.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelSlot {
    pub slot_id: SlotId,
    /// `None` only before the slot is bootstrapped.
    pub active_version_id: Option<VersionId>,
    pub candidate_version_id: Option<VersionId>,
    pub state: SlotState,
    pub created_at: u64,
    pub updated_at: u64,
    /// Most recent rollback, kept so a repeated rollback is a no-op.
    #[serde(default)]
    pub last_rollback: Option<RollbackRecord>,
}

impl ModelSlot {
    pub fn new(slot_id: &str, now: u64) -> Self {
        Self {
            slot_id: slot_id.to_string(),
            active_version_id: None,
            candidate_version_id: None,
            state: SlotState::Idle,
            created_at: now,
            updated_at: now,
            last_rollback: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RollbackRecord {
    pub from_version: VersionId,
    pub to_version: VersionId,
    pub at: u64,
    pub reason: String,
}

// ── Version ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionStatus {
    Candidate,
    Testing,
    Active,
    Retired,
    Rejected,
}

/// Audit note attached to a version when a decision is made about it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DecisionNote {
    /// `reject`, `promote`, `ab_test`, `rollback`, `force_promote`, ...
    pub outcome: String,
    pub reason: String,
    pub compared_to: Option<VersionId>,
    pub at: u64,
}

/// One upstream model release. Created on detection and never deleted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VersionRecord {
    pub version_id: VersionId,
    pub slot_id: SlotId,
    pub changelog: String,
    pub status: VersionStatus,
    pub quality_score: Option<f64>,
    pub detected_at: u64,
    /// Upstream release time reported by the feed.
    pub available_at: Option<u64>,
    pub activated_at: Option<u64>,
    pub retire_at: Option<u64>,
    /// Set once the controller has consumed the detection event.
    #[serde(default)]
    pub signaled: bool,
    #[serde(default)]
    pub benchmark_attempts: u32,
    #[serde(default)]
    pub decision: Option<DecisionNote>,
}

impl VersionRecord {
    /// Fresh `Candidate` record as produced by the version monitor.
    pub fn candidate(slot_id: &str, version_id: &str, changelog: &str, now: u64) -> Self {
        Self {
            version_id: version_id.to_string(),
            slot_id: slot_id.to_string(),
            changelog: changelog.to_string(),
            status: VersionStatus::Candidate,
            quality_score: None,
            detected_at: now,
            available_at: None,
            activated_at: None,
            retire_at: None,
            signaled: false,
            benchmark_attempts: 0,
            decision: None,
        }
    }

    /// Build the composite key for the versions table.
    pub fn table_key(&self) -> String {
        version_key(&self.slot_id, &self.version_id)
    }
}

pub fn version_key(slot_id: &str, version_id: &str) -> String {
    format!("{slot_id}:{version_id}")
}

// ── Benchmark ─────────────────────────────────────────────────────

/// Output of one benchmark run. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BenchmarkResult {
    pub slot_id: SlotId,
    pub version_id: VersionId,
    /// Samples that produced a score.
    pub sample_count: usize,
    pub failed_count: usize,
    /// Metric name → mean value across scored samples.
    pub metrics: BTreeMap<String, f64>,
    pub timestamp: u64,
    pub duration_ms: u64,
}

impl BenchmarkResult {
    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).copied()
    }

    /// Build the composite key for the benchmarks table.
    pub fn table_key(&self) -> String {
        format!("{}:{}:{:020}", self.slot_id, self.version_id, self.timestamp)
    }
}

// ── A/B test ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    /// The incumbent (active) version.
    A,
    /// The candidate.
    B,
}

/// Welford running aggregate: count, mean, and variance in one pass.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct RunningStats {
    pub count: u64,
    pub mean: f64,
    /// Sum of squared deviations from the mean.
    pub m2: f64,
}

impl RunningStats {
    pub fn push(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    /// Sample variance (n − 1). Zero below two observations.
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / (self.count - 1) as f64
        }
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }
}

/// Metric name → running aggregate for one variant.
pub type VariantMetrics = BTreeMap<String, RunningStats>;

/// A live traffic split between the incumbent and a candidate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AbTestSession {
    pub slot_id: SlotId,
    pub variant_a_version: VersionId,
    pub variant_b_version: VersionId,
    /// Fraction of sessions routed to variant B.
    pub traffic_split: f64,
    pub started_at: u64,
    pub ends_at: u64,
    /// The window may be extended once on insufficient data.
    pub extended: bool,
    pub closed_at: Option<u64>,
    pub winner: Option<VersionId>,
    pub conclusion: Option<String>,
    pub per_variant_metrics: BTreeMap<Variant, VariantMetrics>,
}

impl AbTestSession {
    pub fn new(
        slot_id: &str,
        variant_a: &str,
        variant_b: &str,
        traffic_split: f64,
        started_at: u64,
        duration_secs: u64,
    ) -> Self {
        Self {
            slot_id: slot_id.to_string(),
            variant_a_version: variant_a.to_string(),
            variant_b_version: variant_b.to_string(),
            traffic_split,
            started_at,
            ends_at: started_at + duration_secs,
            extended: false,
            closed_at: None,
            winner: None,
            conclusion: None,
            per_variant_metrics: BTreeMap::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.closed_at.is_none()
    }

    pub fn version_for(&self, variant: Variant) -> &str {
        match variant {
            Variant::A => &self.variant_a_version,
            Variant::B => &self.variant_b_version,
        }
    }

    /// Build the composite key for the A/B sessions table.
    pub fn table_key(&self) -> String {
        format!("{}:{:020}", self.slot_id, self.started_at)
    }
}

// ── Rollback window ───────────────────────────────────────────────

/// Bounded period after a promotion during which reverting is possible.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RollbackWindow {
    pub slot_id: SlotId,
    pub promoted_version: VersionId,
    pub previous_version: VersionId,
    pub opened_at: u64,
    pub expires_at: u64,
}

impl RollbackWindow {
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }
}
