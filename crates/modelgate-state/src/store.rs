//! StateStore — redb-backed state persistence for modelgate.
//!
//! Provides typed operations over slots, version records, benchmark
//! results, A/B sessions, and rollback windows. All values are
//! JSON-serialized into redb's `&[u8]` value columns. The store supports
//! both on-disk and in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition, TableHandle, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

type Table = TableDefinition<'static, &'static str, &'static [u8]>;

/// Every record touched by one slot transition, committed atomically.
#[derive(Debug, Default, Clone)]
pub struct ChangeSet {
    pub slot: Option<ModelSlot>,
    pub versions: Vec<VersionRecord>,
    pub benchmarks: Vec<BenchmarkResult>,
    pub ab_sessions: Vec<AbTestSession>,
    pub open_window: Option<RollbackWindow>,
    /// Slot whose rollback window is removed.
    pub close_window: Option<SlotId>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slot(mut self, slot: ModelSlot) -> Self {
        self.slot = Some(slot);
        self
    }

    pub fn version(mut self, record: VersionRecord) -> Self {
        self.versions.push(record);
        self
    }

    pub fn benchmark(mut self, result: BenchmarkResult) -> Self {
        self.benchmarks.push(result);
        self
    }

    pub fn ab_session(mut self, session: AbTestSession) -> Self {
        self.ab_sessions.push(session);
        self
    }

    pub fn open_window(mut self, window: RollbackWindow) -> Self {
        self.open_window = Some(window);
        self
    }

    pub fn close_window(mut self, slot_id: &str) -> Self {
        self.close_window = Some(slot_id.to_string());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.slot.is_none()
            && self.versions.is_empty()
            && self.benchmarks.is_empty()
            && self.ab_sessions.is_empty()
            && self.open_window.is_none()
            && self.close_window.is_none()
    }
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path)?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder().create_with_backend(backend)?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write()?;
        // Opening a table in a write transaction creates it if absent.
        for table in [SLOTS, VERSIONS, BENCHMARKS, AB_SESSIONS, ROLLBACK_WINDOWS] {
            txn.open_table(table)?;
        }
        txn.commit()?;
        Ok(())
    }

    // ── Generic helpers ───────────────────────────────────────────

    fn put<T: Serialize>(&self, table: Table, key: &str, value: &T) -> StateResult<()> {
        let txn = self.db.begin_write()?;
        write_json(&txn, table, key, value)?;
        txn.commit()?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, table: Table, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read()?;
        let name = table.name();
        let table = txn.open_table(table)?;
        match table.get(key)? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value())
                    .map_err(|e| StateError::corrupt(name, key, e))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// All values whose key starts with `prefix`, in key order.
    fn scan<T: DeserializeOwned>(&self, table: Table, prefix: &str) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read()?;
        let name = table.name();
        let table = txn.open_table(table)?;
        let mut results = Vec::new();
        for entry in table.range(prefix..)? {
            let (key, value) = entry?;
            let key = key.value();
            if !key.starts_with(prefix) {
                break;
            }
            let decoded =
                serde_json::from_slice(value.value()).map_err(|e| StateError::corrupt(name, key, e))?;
            results.push(decoded);
        }
        Ok(results)
    }

    // ── Slots ─────────────────────────────────────────────────────

    /// Insert or update a model slot.
    pub fn put_slot(&self, slot: &ModelSlot) -> StateResult<()> {
        self.put(SLOTS, &slot.slot_id, slot)?;
        debug!(slot = %slot.slot_id, state = ?slot.state, "slot stored");
        Ok(())
    }

    pub fn get_slot(&self, slot_id: &str) -> StateResult<Option<ModelSlot>> {
        self.get(SLOTS, slot_id)
    }

    pub fn list_slots(&self) -> StateResult<Vec<ModelSlot>> {
        self.scan(SLOTS, "")
    }

    // ── Versions ──────────────────────────────────────────────────

    /// Insert or update a version record.
    pub fn put_version(&self, record: &VersionRecord) -> StateResult<()> {
        self.put(VERSIONS, &record.table_key(), record)
    }

    /// Insert a version record unless one with the same key exists.
    ///
    /// Returns `true` if the record was inserted. The existence check and the
    /// insert share one write transaction.
    pub fn insert_version_if_absent(&self, record: &VersionRecord) -> StateResult<bool> {
        let key = record.table_key();
        let txn = self.db.begin_write()?;
        let inserted = {
            let mut table = txn.open_table(VERSIONS)?;
            if table.get(key.as_str())?.is_some() {
                false
            } else {
                let value = serde_json::to_vec(record)
                    .map_err(|e| StateError::encode(VERSIONS.name(), &key, e))?;
                table.insert(key.as_str(), value.as_slice())?;
                true
            }
        };
        txn.commit()?;
        if inserted {
            debug!(%key, "version record created");
        }
        Ok(inserted)
    }

    pub fn get_version(&self, slot_id: &str, version_id: &str) -> StateResult<Option<VersionRecord>> {
        self.get(VERSIONS, &version_key(slot_id, version_id))
    }

    /// Full history of a slot, oldest detection first.
    pub fn list_versions(&self, slot_id: &str) -> StateResult<Vec<VersionRecord>> {
        let mut records: Vec<VersionRecord> = self.scan(VERSIONS, &format!("{slot_id}:"))?;
        records.sort_by(|a, b| {
            a.detected_at
                .cmp(&b.detected_at)
                .then_with(|| a.version_id.cmp(&b.version_id))
        });
        Ok(records)
    }

    /// Records still waiting for a decision, oldest first.
    pub fn list_candidates(&self, slot_id: &str) -> StateResult<Vec<VersionRecord>> {
        Ok(self
            .list_versions(slot_id)?
            .into_iter()
            .filter(|r| r.status == VersionStatus::Candidate)
            .collect())
    }

    // ── Benchmarks ────────────────────────────────────────────────

    pub fn put_benchmark(&self, result: &BenchmarkResult) -> StateResult<()> {
        self.put(BENCHMARKS, &result.table_key(), result)
    }

    /// Benchmark results for one version, oldest first.
    pub fn list_benchmarks(&self, slot_id: &str, version_id: &str) -> StateResult<Vec<BenchmarkResult>> {
        self.scan(BENCHMARKS, &format!("{slot_id}:{version_id}:"))
    }

    pub fn latest_benchmark(
        &self,
        slot_id: &str,
        version_id: &str,
    ) -> StateResult<Option<BenchmarkResult>> {
        Ok(self.list_benchmarks(slot_id, version_id)?.pop())
    }

    // ── A/B sessions ──────────────────────────────────────────────

    pub fn put_ab_session(&self, session: &AbTestSession) -> StateResult<()> {
        self.put(AB_SESSIONS, &session.table_key(), session)
    }

    /// All sessions for a slot, oldest first (open and closed).
    pub fn list_ab_sessions(&self, slot_id: &str) -> StateResult<Vec<AbTestSession>> {
        self.scan(AB_SESSIONS, &format!("{slot_id}:"))
    }

    /// The slot's open session, if any.
    pub fn open_ab_session(&self, slot_id: &str) -> StateResult<Option<AbTestSession>> {
        Ok(self
            .list_ab_sessions(slot_id)?
            .into_iter()
            .rev()
            .find(AbTestSession::is_open))
    }

    // ── Rollback windows ──────────────────────────────────────────

    pub fn get_rollback_window(&self, slot_id: &str) -> StateResult<Option<RollbackWindow>> {
        self.get(ROLLBACK_WINDOWS, slot_id)
    }

    pub fn list_rollback_windows(&self) -> StateResult<Vec<RollbackWindow>> {
        self.scan(ROLLBACK_WINDOWS, "")
    }

    // ── Transitions ───────────────────────────────────────────────

    /// Apply every record in `changes` in one write transaction.
    pub fn commit(&self, changes: &ChangeSet) -> StateResult<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let txn = self.db.begin_write()?;
        if let Some(slot) = &changes.slot {
            write_json(&txn, SLOTS, &slot.slot_id, slot)?;
        }
        for record in &changes.versions {
            write_json(&txn, VERSIONS, &record.table_key(), record)?;
        }
        for result in &changes.benchmarks {
            write_json(&txn, BENCHMARKS, &result.table_key(), result)?;
        }
        for session in &changes.ab_sessions {
            write_json(&txn, AB_SESSIONS, &session.table_key(), session)?;
        }
        if let Some(slot_id) = &changes.close_window {
            let mut table = txn.open_table(ROLLBACK_WINDOWS)?;
            table.remove(slot_id.as_str())?;
        }
        if let Some(window) = &changes.open_window {
            write_json(&txn, ROLLBACK_WINDOWS, &window.slot_id, window)?;
        }
        txn.commit()?;
        debug!(
            slot = changes.slot.as_ref().map(|s| s.slot_id.as_str()).unwrap_or("-"),
            versions = changes.versions.len(),
            sessions = changes.ab_sessions.len(),
            "change set committed"
        );
        Ok(())
    }
}

fn write_json<T: Serialize>(
    txn: &WriteTransaction,
    table: Table,
    key: &str,
    value: &T,
) -> StateResult<()> {
    let bytes = serde_json::to_vec(value).map_err(|e| StateError::encode(table.name(), key, e))?;
    let mut table = txn.open_table(table)?;
    table.insert(key, bytes.as_slice())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(slot: &str, version: &str, detected_at: u64) -> VersionRecord {
        VersionRecord::candidate(slot, version, "changelog", detected_at)
    }

    fn benchmark(slot: &str, version: &str, ts: u64, psnr: f64) -> BenchmarkResult {
        BenchmarkResult {
            slot_id: slot.to_string(),
            version_id: version.to_string(),
            sample_count: 100,
            failed_count: 0,
            metrics: [("psnr_db".to_string(), psnr)].into_iter().collect(),
            timestamp: ts,
            duration_ms: 10,
        }
    }

    // ── Slots ──────────────────────────────────────────────────────

    #[test]
    fn slot_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let mut slot = ModelSlot::new("image-generation", 1000);
        slot.active_version_id = Some("v1".into());
        store.put_slot(&slot).unwrap();

        assert_eq!(store.get_slot("image-generation").unwrap(), Some(slot));
        assert!(store.get_slot("nope").unwrap().is_none());
    }

    #[test]
    fn slot_list_all() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_slot(&ModelSlot::new("a", 1)).unwrap();
        store.put_slot(&ModelSlot::new("b", 1)).unwrap();
        assert_eq!(store.list_slots().unwrap().len(), 2);
    }

    // ── Versions ───────────────────────────────────────────────────

    #[test]
    fn insert_version_is_idempotent() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.insert_version_if_absent(&candidate("s", "v2", 10)).unwrap());

        let mut again = candidate("s", "v2", 20);
        again.changelog = "different".into();
        assert!(!store.insert_version_if_absent(&again).unwrap());

        let stored = store.get_version("s", "v2").unwrap().unwrap();
        assert_eq!(stored.detected_at, 10);
        assert_eq!(stored.changelog, "changelog");
    }

    #[test]
    fn versions_are_scoped_to_slot_and_ordered() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_version(&candidate("s", "v3", 30)).unwrap();
        store.put_version(&candidate("s", "v1", 10)).unwrap();
        store.put_version(&candidate("s2", "v9", 5)).unwrap();
        // Prefix `s:` must not pick up `s2:`.
        let ids: Vec<_> = store
            .list_versions("s")
            .unwrap()
            .into_iter()
            .map(|r| r.version_id)
            .collect();
        assert_eq!(ids, vec!["v1", "v3"]);
    }

    #[test]
    fn list_candidates_filters_status() {
        let store = StateStore::open_in_memory().unwrap();
        let mut active = candidate("s", "v1", 1);
        active.status = VersionStatus::Active;
        store.put_version(&active).unwrap();
        store.put_version(&candidate("s", "v2", 2)).unwrap();
        let pending = store.list_candidates("s").unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].version_id, "v2");
    }

    // ── Benchmarks ─────────────────────────────────────────────────

    #[test]
    fn latest_benchmark_is_newest() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_benchmark(&benchmark("s", "v1", 100, 33.0)).unwrap();
        store.put_benchmark(&benchmark("s", "v1", 200, 35.0)).unwrap();
        store.put_benchmark(&benchmark("s", "v10", 300, 20.0)).unwrap();

        assert_eq!(store.list_benchmarks("s", "v1").unwrap().len(), 2);
        let latest = store.latest_benchmark("s", "v1").unwrap().unwrap();
        assert_eq!(latest.metric("psnr_db"), Some(35.0));
    }

    // ── A/B sessions ───────────────────────────────────────────────

    #[test]
    fn open_session_ignores_closed() {
        let store = StateStore::open_in_memory().unwrap();
        let mut old = AbTestSession::new("s", "v1", "v2", 0.5, 100, 10);
        old.closed_at = Some(110);
        store.put_ab_session(&old).unwrap();
        assert!(store.open_ab_session("s").unwrap().is_none());

        let live = AbTestSession::new("s", "v1", "v3", 0.5, 200, 10);
        store.put_ab_session(&live).unwrap();
        assert_eq!(store.open_ab_session("s").unwrap(), Some(live));
        assert_eq!(store.list_ab_sessions("s").unwrap().len(), 2);
    }

    // ── Change sets ────────────────────────────────────────────────

    #[test]
    fn commit_applies_all_records() {
        let store = StateStore::open_in_memory().unwrap();
        let mut slot = ModelSlot::new("s", 1);
        slot.state = SlotState::RollbackWindowOpen;
        slot.active_version_id = Some("v2".into());
        let window = RollbackWindow {
            slot_id: "s".into(),
            promoted_version: "v2".into(),
            previous_version: "v1".into(),
            opened_at: 1,
            expires_at: 100,
        };
        let changes = ChangeSet::new()
            .slot(slot.clone())
            .version(candidate("s", "v2", 1))
            .benchmark(benchmark("s", "v2", 1, 39.0))
            .open_window(window.clone());
        store.commit(&changes).unwrap();

        assert_eq!(store.get_slot("s").unwrap(), Some(slot));
        assert!(store.get_version("s", "v2").unwrap().is_some());
        assert_eq!(store.get_rollback_window("s").unwrap(), Some(window));
        assert_eq!(store.list_rollback_windows().unwrap().len(), 1);

        store.commit(&ChangeSet::new().close_window("s")).unwrap();
        assert!(store.get_rollback_window("s").unwrap().is_none());
    }

    #[test]
    fn empty_change_set_is_noop() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(ChangeSet::new().is_empty());
        store.commit(&ChangeSet::new()).unwrap();
        assert!(store.list_slots().unwrap().is_empty());
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store.put_slot(&ModelSlot::new("image-generation", 5)).unwrap();
            store.put_version(&candidate("image-generation", "v2", 5)).unwrap();
        }

        // Reopen the same database file.
        let store = StateStore::open(&db_path).unwrap();
        assert!(store.get_slot("image-generation").unwrap().is_some());
        assert_eq!(store.list_versions("image-generation").unwrap().len(), 1);
    }

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.list_slots().unwrap().is_empty());
        assert!(store.list_versions("any").unwrap().is_empty());
        assert!(store.latest_benchmark("any", "v").unwrap().is_none());
        assert!(store.open_ab_session("any").unwrap().is_none());
        assert!(store.list_rollback_windows().unwrap().is_empty());
    }

    #[test]
    fn undecodable_record_names_table_and_key() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_version(&candidate("img", "v1", 1)).unwrap();
        let txn = store.db.begin_write().unwrap();
        {
            let mut table = txn.open_table(VERSIONS).unwrap();
            table.insert("img:v2", b"not json".as_slice()).unwrap();
        }
        txn.commit().unwrap();

        match store.get_version("img", "v2").unwrap_err() {
            StateError::CorruptRecord { table, key, .. } => {
                assert_eq!(table, "versions");
                assert_eq!(key, "img:v2");
            }
            other => panic!("unexpected error: {other}"),
        }
        let err = store.list_versions("img").unwrap_err();
        assert!(err.to_string().contains("corrupt versions record img:v2"));
        assert!(store.get_version("img", "v1").unwrap().is_some());
    }
}
