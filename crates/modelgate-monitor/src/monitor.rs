//! Version monitor — periodic candidate detection across slots.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use modelgate_core::{system_clock, Clock, SlotId, VersionId};
use modelgate_state::{StateStore, VersionRecord};

use crate::error::{FeedError, FeedResult};
use crate::feed::VersionSource;

/// Emitted once per newly persisted candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateDetected {
    pub slot_id: SlotId,
    pub version_id: VersionId,
}

pub struct VersionMonitor {
    state: StateStore,
    source: Arc<dyn VersionSource>,
    slots: Vec<SlotId>,
    events: Option<mpsc::Sender<CandidateDetected>>,
    clock: Clock,
}

impl VersionMonitor {
    pub fn new(state: StateStore, source: Arc<dyn VersionSource>, slots: Vec<SlotId>) -> Self {
        Self {
            state,
            source,
            slots,
            events: None,
            clock: system_clock(),
        }
    }

    /// Announce detected candidates on `events`.
    pub fn with_events(mut self, events: mpsc::Sender<CandidateDetected>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn source(&self) -> &Arc<dyn VersionSource> {
        &self.source
    }

    pub fn slots(&self) -> &[SlotId] {
        &self.slots
    }

    /// Fetch the feed for `slot_id` and persist every valid, unseen entry
    /// as a `Candidate`. Returns the newly created records.
    ///
    /// Invalid and withdrawn entries are logged and skipped. Entries
    /// already in the slot's history are no-ops.
    pub async fn detect(&self, slot_id: &str) -> FeedResult<Vec<VersionRecord>> {
        let mut entries = self
            .source
            .fetch(slot_id)
            .await
            .map_err(|e| FeedError::Fetch {
                slot: slot_id.to_string(),
                reason: format!("{e:#}"),
            })?;
        // Oldest upstream release first; undated entries keep feed order at the end.
        entries.sort_by_key(|e| e.available_at.unwrap_or(u64::MAX));

        let now = (self.clock)();
        let mut created = Vec::new();
        for entry in entries {
            if let Err(e) = entry.validate(slot_id) {
                warn!(slot = %slot_id, error = %e, "skipping feed entry");
                continue;
            }
            if entry.withdrawn {
                debug!(slot = %slot_id, version = %entry.version_id, "skipping withdrawn release");
                continue;
            }
            let mut record =
                VersionRecord::candidate(slot_id, &entry.version_id, &entry.changelog, now);
            record.available_at = entry.available_at;
            if self.state.insert_version_if_absent(&record)? {
                info!(slot = %slot_id, version = %record.version_id, "candidate detected");
                created.push(record);
            }
        }
        if created.is_empty() {
            debug!(slot = %slot_id, "no new versions");
        }
        Ok(created)
    }

    /// `detect`, then announce each new candidate.
    pub async fn poll_slot(&self, slot_id: &str) -> FeedResult<usize> {
        let created = self.detect(slot_id).await?;
        for record in &created {
            self.signal(slot_id, &record.version_id).await;
        }
        Ok(created.len())
    }

    /// Poll every configured slot. Per-slot failures are logged.
    pub async fn poll_all(&self) -> usize {
        let mut total = 0;
        for slot_id in &self.slots {
            match self.poll_slot(slot_id).await {
                Ok(n) => total += n,
                Err(e) => warn!(slot = %slot_id, error = %e, "version poll failed"),
            }
        }
        total
    }

    async fn signal(&self, slot_id: &str, version_id: &str) {
        let Some(events) = &self.events else {
            return;
        };
        let event = CandidateDetected {
            slot_id: slot_id.to_string(),
            version_id: version_id.to_string(),
        };
        if events.send(event).await.is_err() {
            // The record stays unsignalled and is picked up on restart.
            warn!(slot = %slot_id, version = %version_id, "candidate event receiver closed");
        }
    }

    /// Poll immediately and then every `interval` until `shutdown` flips.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = interval.as_secs(),
            slots = self.slots.len(),
            "version monitor started"
        );
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let found = self.poll_all().await;
                    debug!(found, "version poll complete");
                }
                _ = shutdown.changed() => {
                    info!("version monitor shutting down");
                    return;
                }
            }
        }
    }
}
