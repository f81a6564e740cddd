//! Traffic router — resolves `(slot_id, session_key)` to a version id.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use thiserror::Error;
use tracing::debug;

use modelgate_state::{AbTestSession, ModelSlot, SlotState, Variant, VersionId};

use crate::stable_hash::{stable_hash64, unit_interval};

pub type RouteResult<T> = Result<T, RouteError>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("unknown slot: {0}")]
    UnknownSlot(String),

    #[error("slot {0} has no active version yet")]
    NoActiveVersion(String),
}

/// Result of one routing decision.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Assignment {
    pub version_id: VersionId,
    /// Set only while an A/B test is running.
    pub variant: Option<Variant>,
}

/// Routing state for one running A/B test.
#[derive(Debug, Clone, PartialEq)]
pub struct AbRoute {
    pub started_at: u64,
    pub variant_a: VersionId,
    pub variant_b: VersionId,
    /// Fraction of sessions sent to variant B.
    pub traffic_split: f64,
    seed: u64,
}

impl AbRoute {
    pub fn new(session: &AbTestSession) -> Self {
        Self {
            started_at: session.started_at,
            variant_a: session.variant_a_version.clone(),
            variant_b: session.variant_b_version.clone(),
            traffic_split: session.traffic_split,
            seed: stable_hash64(session.started_at, &session.slot_id),
        }
    }

    /// True if `session` describes the same test as this route.
    fn same_test(&self, session: &AbTestSession) -> bool {
        self.started_at == session.started_at
            && self.variant_a == session.variant_a_version
            && self.variant_b == session.variant_b_version
            && self.traffic_split == session.traffic_split
    }

    /// Variant for `session_key`. Fixed for the life of this test.
    pub fn variant(&self, session_key: &str) -> Variant {
        if unit_interval(self.seed, session_key) < self.traffic_split {
            Variant::B
        } else {
            Variant::A
        }
    }

    pub fn version(&self, variant: Variant) -> &str {
        match variant {
            Variant::A => &self.variant_a,
            Variant::B => &self.variant_b,
        }
    }
}

/// Immutable view of one slot as seen by the serving path.
#[derive(Debug, Clone)]
pub struct RouteSnapshot {
    pub slot_id: String,
    pub active_version: Option<VersionId>,
    pub state: SlotState,
    pub ab: Option<Arc<AbRoute>>,
}

impl RouteSnapshot {
    /// Build a snapshot from committed slot state.
    ///
    /// `session` is ignored unless the slot is in `AbTesting` and the
    /// session is still open.
    pub fn from_slot(slot: &ModelSlot, session: Option<&AbTestSession>) -> Self {
        let ab = match (slot.state, session) {
            (SlotState::AbTesting, Some(s)) if s.is_open() => Some(Arc::new(AbRoute::new(s))),
            _ => None,
        };
        Self {
            slot_id: slot.slot_id.clone(),
            active_version: slot.active_version_id.clone(),
            state: slot.state,
            ab,
        }
    }

    fn assign(&self, session_key: &str) -> RouteResult<Assignment> {
        if let Some(ab) = &self.ab {
            let variant = ab.variant(session_key);
            return Ok(Assignment {
                version_id: ab.version(variant).to_string(),
                variant: Some(variant),
            });
        }
        match &self.active_version {
            Some(v) => Ok(Assignment {
                version_id: v.clone(),
                variant: None,
            }),
            None => Err(RouteError::NoActiveVersion(self.slot_id.clone())),
        }
    }
}

type SnapshotMap = HashMap<String, Arc<RouteSnapshot>>;

/// Serving-layer hook. Cheap to clone; all clones share the same snapshots.
#[derive(Clone, Default)]
pub struct TrafficRouter {
    slots: Arc<ArcSwap<SnapshotMap>>,
}

impl TrafficRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a new snapshot for a slot.
    pub fn publish(&self, snapshot: RouteSnapshot) {
        let slot_id = snapshot.slot_id.clone();
        let snapshot = Arc::new(snapshot);
        self.slots.rcu(|current| {
            let mut map = SnapshotMap::clone(current);
            map.insert(slot_id.clone(), Arc::clone(&snapshot));
            map
        });
        debug!(slot = %slot_id, "route snapshot published");
    }

    /// Publish from committed slot state and its open session.
    pub fn publish_slot(&self, slot: &ModelSlot, session: Option<&AbTestSession>) {
        self.publish(RouteSnapshot::from_slot(slot, session));
    }

    pub fn remove(&self, slot_id: &str) {
        self.slots.rcu(|current| {
            let mut map = SnapshotMap::clone(current);
            map.remove(slot_id);
            map
        });
    }

    /// `route(slot_id, session_key) -> version_id`.
    pub fn route(&self, slot_id: &str, session_key: &str) -> RouteResult<VersionId> {
        self.assign(slot_id, session_key).map(|a| a.version_id)
    }

    /// Like [`route`](Self::route) but also reports the A/B variant.
    pub fn assign(&self, slot_id: &str, session_key: &str) -> RouteResult<Assignment> {
        let slots = self.slots.load();
        let snapshot = slots
            .get(slot_id)
            .ok_or_else(|| RouteError::UnknownSlot(slot_id.to_string()))?;
        snapshot.assign(session_key)
    }

    pub fn snapshot(&self, slot_id: &str) -> Option<Arc<RouteSnapshot>> {
        self.slots.load().get(slot_id).cloned()
    }

    /// True if `session` is the test currently routed for its slot.
    pub fn routes_session(&self, session: &AbTestSession) -> bool {
        self.snapshot(&session.slot_id)
            .and_then(|s| s.ab.clone())
            .is_some_and(|ab| ab.same_test(session))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active_slot(id: &str, version: &str) -> ModelSlot {
        let mut slot = ModelSlot::new(id, 1);
        slot.active_version_id = Some(version.to_string());
        slot
    }

    fn testing_slot(id: &str) -> (ModelSlot, AbTestSession) {
        let mut slot = active_slot(id, "v1");
        slot.state = SlotState::AbTesting;
        slot.candidate_version_id = Some("v2".into());
        let session = AbTestSession::new(id, "v1", "v2", 0.5, 1000, 86_400);
        (slot, session)
    }

    #[test]
    fn routes_to_active_without_test() {
        let router = TrafficRouter::new();
        router.publish_slot(&active_slot("img", "v1"), None);
        for key in ["a", "b", "c"] {
            assert_eq!(router.route("img", key).unwrap(), "v1");
        }
    }

    #[test]
    fn unknown_and_unbootstrapped_slots() {
        let router = TrafficRouter::new();
        assert_eq!(
            router.route("nope", "k"),
            Err(RouteError::UnknownSlot("nope".into()))
        );
        router.publish_slot(&ModelSlot::new("empty", 1), None);
        assert_eq!(
            router.route("empty", "k"),
            Err(RouteError::NoActiveVersion("empty".into()))
        );
    }

    #[test]
    fn sticky_assignment_is_stable() {
        let router = TrafficRouter::new();
        let (slot, session) = testing_slot("img");
        router.publish_slot(&slot, Some(&session));

        for i in 0..50 {
            let key = format!("session-{i}");
            let first = router.route("img", &key).unwrap();
            for _ in 0..5 {
                assert_eq!(router.route("img", &key).unwrap(), first);
            }
        }
    }

    #[test]
    fn split_sends_both_variants_traffic() {
        let router = TrafficRouter::new();
        let (slot, session) = testing_slot("img");
        router.publish_slot(&slot, Some(&session));

        let to_b = (0..4000)
            .filter(|i| router.route("img", &format!("s{i}")).unwrap() == "v2")
            .count();
        assert!((1700..2300).contains(&to_b), "variant B got {to_b}");
    }

    #[test]
    fn extreme_splits() {
        let router = TrafficRouter::new();
        let (slot, mut session) = testing_slot("img");
        session.traffic_split = 0.0;
        router.publish_slot(&slot, Some(&session));
        assert!((0..200).all(|i| router.route("img", &format!("k{i}")).unwrap() == "v1"));

        session.traffic_split = 1.0;
        router.publish_slot(&slot, Some(&session));
        assert!((0..200).all(|i| router.route("img", &format!("k{i}")).unwrap() == "v2"));
    }

    #[test]
    fn republishing_same_test_keeps_assignments() {
        let router = TrafficRouter::new();
        let (slot, mut session) = testing_slot("img");
        router.publish_slot(&slot, Some(&session));
        let before: Vec<_> = (0..50)
            .map(|i| router.route("img", &format!("k{i}")).unwrap())
            .collect();

        // Extension changes `ends_at` only.
        session.ends_at += 3600;
        session.extended = true;
        router.publish_slot(&slot, Some(&session));
        let after: Vec<_> = (0..50)
            .map(|i| router.route("img", &format!("k{i}")).unwrap())
            .collect();
        assert_eq!(before, after);
        assert!(router.routes_session(&session));
    }

    #[test]
    fn conclusion_drops_assignments() {
        let router = TrafficRouter::new();
        let (mut slot, session) = testing_slot("img");
        router.publish_slot(&slot, Some(&session));
        router.route("img", "k1").unwrap();

        slot.state = SlotState::RollbackWindowOpen;
        slot.active_version_id = Some("v2".into());
        slot.candidate_version_id = None;
        router.publish_slot(&slot, None);

        let snap = router.snapshot("img").unwrap();
        assert!(snap.ab.is_none());
        assert_eq!(router.route("img", "k1").unwrap(), "v2");
        assert!(!router.routes_session(&session));
    }

    #[test]
    fn new_test_reshuffles_assignments() {
        let router = TrafficRouter::new();
        let (slot, session) = testing_slot("img");
        router.publish_slot(&slot, Some(&session));
        let first: Vec<_> = (0..200)
            .map(|i| router.assign("img", &format!("k{i}")).unwrap().variant)
            .collect();

        let next = AbTestSession::new("img", "v1", "v2", 0.5, 5000, 86_400);
        router.publish_slot(&slot, Some(&next));
        assert!(!router.routes_session(&session));
        let second: Vec<_> = (0..200)
            .map(|i| router.assign("img", &format!("k{i}")).unwrap().variant)
            .collect();
        assert_ne!(first, second);
    }

    #[test]
    fn closed_session_is_not_routed() {
        let router = TrafficRouter::new();
        let (slot, mut session) = testing_slot("img");
        session.closed_at = Some(2000);
        router.publish_slot(&slot, Some(&session));
        assert_eq!(router.route("img", "k").unwrap(), "v1");
    }

    #[tokio::test]
    async fn concurrent_routes_agree() {
        let router = TrafficRouter::new();
        let (slot, session) = testing_slot("img");
        router.publish_slot(&slot, Some(&session));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let router = router.clone();
            handles.push(tokio::spawn(async move {
                (0..100)
                    .map(|i| router.route("img", &format!("u{i}")).unwrap())
                    .collect::<Vec<_>>()
            }));
        }
        let mut results = Vec::new();
        for h in handles {
            results.push(h.await.unwrap());
        }
        assert!(results.windows(2).all(|w| w[0] == w[1]));
    }
}
