//! Metrics aggregator — running outcome statistics per slot and variant.
//!
//! Each slot has at most one A/B aggregate (mirroring its open session) and
//! at most one post-promotion watch. Updates take a short per-slot lock and
//! never touch storage; the state machine persists snapshots on its tick.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::debug;

use modelgate_state::{AbTestSession, RunningStats, SlotId, Variant, VariantMetrics, VersionId};

/// Where an outcome report ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recorded {
    /// Folded into the slot's open A/B test.
    Variant(Variant),
    /// Folded into the post-promotion watch.
    Watch,
    /// No open test or watch covers this version.
    Ignored,
}

struct SessionAggregate {
    started_at: u64,
    variant_a: VersionId,
    variant_b: VersionId,
    stats: Mutex<BTreeMap<Variant, VariantMetrics>>,
}

struct VersionWatch {
    version: VersionId,
    stats: Mutex<VariantMetrics>,
}

/// Read-only copy of one slot's A/B aggregates.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AbSnapshot {
    pub slot_id: SlotId,
    pub started_at: u64,
    pub variant_a: VersionId,
    pub variant_b: VersionId,
    pub per_variant: BTreeMap<Variant, VariantMetrics>,
}

impl AbSnapshot {
    pub fn version(&self, variant: Variant) -> &str {
        match variant {
            Variant::A => &self.variant_a,
            Variant::B => &self.variant_b,
        }
    }

    pub fn stats(&self, variant: Variant, metric: &str) -> RunningStats {
        self.per_variant
            .get(&variant)
            .and_then(|m| m.get(metric))
            .copied()
            .unwrap_or_default()
    }
}

/// Read-only copy of a post-promotion watch.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct WatchSnapshot {
    pub slot_id: SlotId,
    pub version: VersionId,
    pub metrics: VariantMetrics,
}

#[derive(Default)]
pub struct MetricsAggregator {
    sessions: RwLock<HashMap<SlotId, Arc<SessionAggregate>>>,
    watches: RwLock<HashMap<SlotId, Arc<VersionWatch>>>,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start aggregating for `session`, seeded with its persisted aggregates.
    ///
    /// Re-registering the session that is already tracked keeps the live
    /// aggregates, which are never older than the persisted ones.
    pub fn begin_session(&self, session: &AbTestSession) {
        let mut sessions = self.sessions.write();
        if let Some(existing) = sessions.get(&session.slot_id)
            && existing.started_at == session.started_at
        {
            return;
        }
        sessions.insert(
            session.slot_id.clone(),
            Arc::new(SessionAggregate {
                started_at: session.started_at,
                variant_a: session.variant_a_version.clone(),
                variant_b: session.variant_b_version.clone(),
                stats: Mutex::new(session.per_variant_metrics.clone()),
            }),
        );
        debug!(slot = %session.slot_id, started_at = session.started_at, "aggregating A/B outcomes");
    }

    /// Stop aggregating and return the final snapshot.
    pub fn end_session(&self, slot_id: &str) -> Option<AbSnapshot> {
        let agg = self.sessions.write().remove(slot_id)?;
        Some(snapshot_of(slot_id, &agg))
    }

    pub fn snapshot(&self, slot_id: &str) -> Option<AbSnapshot> {
        let sessions = self.sessions.read();
        sessions.get(slot_id).map(|agg| snapshot_of(slot_id, agg))
    }

    /// Snapshots of every open test, sorted by slot id.
    pub fn snapshots(&self) -> Vec<AbSnapshot> {
        let sessions = self.sessions.read();
        let mut out: Vec<AbSnapshot> = sessions
            .iter()
            .map(|(slot, agg)| snapshot_of(slot, agg))
            .collect();
        out.sort_by(|a, b| a.slot_id.cmp(&b.slot_id));
        out
    }

    /// Track outcomes for a freshly promoted version.
    pub fn watch(&self, slot_id: &str, version: &str) {
        self.watches.write().insert(
            slot_id.to_string(),
            Arc::new(VersionWatch {
                version: version.to_string(),
                stats: Mutex::new(VariantMetrics::new()),
            }),
        );
        debug!(slot = %slot_id, version = %version, "watching promoted version");
    }

    pub fn unwatch(&self, slot_id: &str) {
        self.watches.write().remove(slot_id);
    }

    pub fn watch_snapshot(&self, slot_id: &str) -> Option<WatchSnapshot> {
        let watches = self.watches.read();
        let w = watches.get(slot_id)?;
        Some(WatchSnapshot {
            slot_id: slot_id.to_string(),
            version: w.version.clone(),
            metrics: w.stats.lock().clone(),
        })
    }

    /// Fold one outcome for `version_id` on `slot_id` into whatever covers it.
    pub fn record(
        &self,
        slot_id: &str,
        version_id: &str,
        outcome: &BTreeMap<String, f64>,
    ) -> Recorded {
        let session = self.sessions.read().get(slot_id).cloned();
        if let Some(agg) = session {
            let variant = if version_id == agg.variant_a {
                Some(Variant::A)
            } else if version_id == agg.variant_b {
                Some(Variant::B)
            } else {
                None
            };
            if let Some(variant) = variant {
                let mut stats = agg.stats.lock();
                let metrics = stats.entry(variant).or_default();
                fold(metrics, outcome);
                return Recorded::Variant(variant);
            }
        }

        let watch = self.watches.read().get(slot_id).cloned();
        if let Some(w) = watch
            && w.version == version_id
        {
            fold(&mut w.stats.lock(), outcome);
            return Recorded::Watch;
        }
        Recorded::Ignored
    }
}

fn fold(metrics: &mut VariantMetrics, outcome: &BTreeMap<String, f64>) {
    for (name, value) in outcome {
        metrics.entry(name.clone()).or_default().push(*value);
    }
}

fn snapshot_of(slot_id: &str, agg: &SessionAggregate) -> AbSnapshot {
    AbSnapshot {
        slot_id: slot_id.to_string(),
        started_at: agg.started_at,
        variant_a: agg.variant_a.clone(),
        variant_b: agg.variant_b.clone(),
        per_variant: agg.stats.lock().clone(),
    }
}
