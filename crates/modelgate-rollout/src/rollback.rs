//! Rollback manager — the post-promotion safety net.
//!
//! Builds the change sets for reverting a promotion and for letting a
//! window lapse, checks that the rollback target is still servable, and
//! evaluates the automatic quality alarm. The controller applies the
//! results under the slot's lock.

use std::sync::Arc;

use tracing::{error, warn};

use modelgate_core::QualityAlarm;
use modelgate_metrics::WatchSnapshot;
use modelgate_monitor::VersionSource;
use modelgate_state::{
    ChangeSet, DecisionNote, ModelSlot, RollbackRecord, RollbackWindow, VersionRecord,
    VersionStatus,
};

use crate::error::{ControlError, ControlResult};
use crate::machine::{next_state, Transition};

pub struct RollbackManager {
    source: Arc<dyn VersionSource>,
}

impl RollbackManager {
    pub fn new(source: Arc<dyn VersionSource>) -> Self {
        Self { source }
    }

    /// Fail with `RollbackUnavailable` if upstream reports `version` as
    /// withdrawn. A feed outage is logged and does not block the rollback.
    pub async fn ensure_servable(&self, slot_id: &str, version: &str) -> ControlResult<()> {
        match self.source.is_servable(slot_id, version).await {
            Ok(true) => Ok(()),
            Ok(false) => {
                error!(slot = %slot_id, version = %version, "rollback target is no longer servable");
                Err(ControlError::RollbackUnavailable {
                    slot: slot_id.to_string(),
                    version: version.to_string(),
                    reason: "withdrawn upstream".to_string(),
                })
            }
            Err(e) => {
                warn!(
                    slot = %slot_id,
                    version = %version,
                    error = %format!("{e:#}"),
                    "could not confirm rollback target; proceeding"
                );
                Ok(())
            }
        }
    }

    /// Revert `slot` to the window's previous version.
    ///
    /// `promoted` and `previous` are the current records of the window's
    /// two versions.
    pub fn plan_rollback(
        &self,
        slot: &ModelSlot,
        window: &RollbackWindow,
        promoted: &VersionRecord,
        previous: &VersionRecord,
        reason: &str,
        now: u64,
    ) -> ControlResult<(ModelSlot, ChangeSet)> {
        if window.is_expired(now) {
            return Err(ControlError::invalid(format!(
                "rollback window for {} expired at {}",
                slot.slot_id, window.expires_at
            )));
        }
        if slot.active_version_id.as_deref() != Some(window.promoted_version.as_str()) {
            return Err(ControlError::invalid(format!(
                "slot {} is no longer serving {}",
                slot.slot_id, window.promoted_version
            )));
        }

        let mut next = slot.clone();
        next.state = next_state(slot.state, Transition::Rollback)?;
        next.active_version_id = Some(previous.version_id.clone());
        next.candidate_version_id = None;
        next.updated_at = now;
        next.last_rollback = Some(RollbackRecord {
            from_version: promoted.version_id.clone(),
            to_version: previous.version_id.clone(),
            at: now,
            reason: reason.to_string(),
        });

        let mut restored = previous.clone();
        restored.status = VersionStatus::Active;
        restored.activated_at = Some(now);
        restored.retire_at = None;

        let mut demoted = promoted.clone();
        demoted.status = VersionStatus::Rejected;
        demoted.retire_at = Some(now);
        demoted.decision = Some(DecisionNote {
            outcome: "rollback".to_string(),
            reason: reason.to_string(),
            compared_to: Some(previous.version_id.clone()),
            at: now,
        });

        let changes = ChangeSet::new()
            .slot(next.clone())
            .version(restored)
            .version(demoted)
            .close_window(&slot.slot_id);
        Ok((next, changes))
    }

    /// Collapse an expired window; rollback is no longer offered.
    pub fn plan_expiry(
        &self,
        slot: &ModelSlot,
        window: &RollbackWindow,
        now: u64,
    ) -> ControlResult<Option<(ModelSlot, ChangeSet)>> {
        if !window.is_expired(now) {
            return Ok(None);
        }
        let mut next = slot.clone();
        next.state = next_state(slot.state, Transition::ExpireWindow)?;
        next.updated_at = now;
        let changes = ChangeSet::new().slot(next.clone()).close_window(&slot.slot_id);
        Ok(Some((next, changes)))
    }
}

/// Reason string if the alarm has tripped for the watched version.
pub fn alarm_tripped(alarm: &QualityAlarm, watch: &WatchSnapshot) -> Option<String> {
    let stats = watch.metrics.get(&alarm.metric)?;
    if stats.count < alarm.min_samples || !alarm.tripped(stats.mean) {
        return None;
    }
    Some(format!(
        "quality alarm: {} mean {:.4} crossed threshold {} after {} observations",
        alarm.metric, stats.mean, alarm.threshold, stats.count
    ))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use async_trait::async_trait;

    use modelgate_core::Direction;
    use modelgate_monitor::FeedEntry;
    use modelgate_state::{RunningStats, SlotState};

    use super::*;

    struct Feed(Vec<FeedEntry>);

    #[async_trait]
    impl VersionSource for Feed {
        async fn fetch(&self, _slot_id: &str) -> anyhow::Result<Vec<FeedEntry>> {
            Ok(self.0.clone())
        }
    }

    struct DownFeed;

    #[async_trait]
    impl VersionSource for DownFeed {
        async fn fetch(&self, _slot_id: &str) -> anyhow::Result<Vec<FeedEntry>> {
            anyhow::bail!("unreachable")
        }
    }

    fn fixture() -> (ModelSlot, RollbackWindow, VersionRecord, VersionRecord) {
        let mut slot = ModelSlot::new("img", 0);
        slot.active_version_id = Some("v2".into());
        slot.state = SlotState::RollbackWindowOpen;
        let window = RollbackWindow {
            slot_id: "img".into(),
            promoted_version: "v2".into(),
            previous_version: "v1".into(),
            opened_at: 100,
            expires_at: 200,
        };
        let mut promoted = VersionRecord::candidate("img", "v2", "", 50);
        promoted.status = VersionStatus::Active;
        let mut previous = VersionRecord::candidate("img", "v1", "", 10);
        previous.status = VersionStatus::Retired;
        previous.retire_at = Some(200);
        (slot, window, promoted, previous)
    }

    #[test]
    fn rollback_restores_previous() {
        let (slot, window, promoted, previous) = fixture();
        let mgr = RollbackManager::new(Arc::new(Feed(vec![])));
        let (next, changes) = mgr
            .plan_rollback(&slot, &window, &promoted, &previous, "manual", 150)
            .unwrap();

        assert_eq!(next.state, SlotState::Idle);
        assert_eq!(next.active_version_id.as_deref(), Some("v1"));
        assert_eq!(next.last_rollback.as_ref().unwrap().from_version, "v2");
        assert_eq!(changes.close_window.as_deref(), Some("img"));
        let restored = changes.versions.iter().find(|v| v.version_id == "v1").unwrap();
        assert_eq!(restored.status, VersionStatus::Active);
        assert_eq!(restored.retire_at, None);
        let demoted = changes.versions.iter().find(|v| v.version_id == "v2").unwrap();
        assert_eq!(demoted.status, VersionStatus::Rejected);
    }

    #[test]
    fn expired_window_refuses_rollback() {
        let (slot, window, promoted, previous) = fixture();
        let mgr = RollbackManager::new(Arc::new(Feed(vec![])));
        let err = mgr
            .plan_rollback(&slot, &window, &promoted, &previous, "manual", 200)
            .unwrap_err();
        assert_eq!(err.code(), "invalid_transition");

        let (next, _) = mgr.plan_expiry(&slot, &window, 200).unwrap().unwrap();
        assert_eq!(next.state, SlotState::Idle);
        assert!(mgr.plan_expiry(&slot, &window, 199).unwrap().is_none());
    }

    #[tokio::test]
    async fn withdrawn_target_is_fatal() {
        let withdrawn = FeedEntry {
            withdrawn: true,
            ..FeedEntry::new("v1")
        };
        let mgr = RollbackManager::new(Arc::new(Feed(vec![withdrawn])));
        let err = mgr.ensure_servable("img", "v1").await.unwrap_err();
        assert_eq!(err.code(), "fatal");

        let mgr = RollbackManager::new(Arc::new(DownFeed));
        assert!(mgr.ensure_servable("img", "v1").await.is_ok());
    }

    #[test]
    fn alarm_needs_min_samples() {
        let alarm = QualityAlarm {
            metric: "user_rating".into(),
            direction: Direction::HigherIsBetter,
            threshold: 3.5,
            min_samples: 3,
        };
        let mut stats = RunningStats::default();
        stats.push(2.0);
        stats.push(2.0);
        let mut watch = WatchSnapshot {
            slot_id: "img".into(),
            version: "v2".into(),
            metrics: BTreeMap::from([("user_rating".to_string(), stats)]),
        };
        assert!(alarm_tripped(&alarm, &watch).is_none());

        watch.metrics.get_mut("user_rating").unwrap().push(2.0);
        assert!(alarm_tripped(&alarm, &watch).unwrap().contains("user_rating"));

        let healthy = RunningStats { count: 10, mean: 4.2, m2: 0.0 };
        watch.metrics.insert("user_rating".into(), healthy);
        assert!(alarm_tripped(&alarm, &watch).is_none());
    }
}
