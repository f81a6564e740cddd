//! modelgate-state — embedded state store for the release controller.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for model slots, the append-only version history, benchmark
//! results, A/B test sessions, and rollback windows.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{slot_id}:{version_id}`, `{slot_id}:{started_at}`) enable
//! prefix scans over one slot's records.
//!
//! A [`ChangeSet`] bundles every record touched by one state transition and
//! is committed in a single write transaction, so a crash never leaves a
//! half-applied transition behind.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::{ChangeSet, StateStore};
pub use types::*;
