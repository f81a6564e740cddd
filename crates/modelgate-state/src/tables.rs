//! redb table definitions for the modelgate state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Model slots keyed by `{slot_id}`.
pub const SLOTS: TableDefinition<&str, &[u8]> = TableDefinition::new("slots");

/// Version records keyed by `{slot_id}:{version_id}`. Never deleted.
pub const VERSIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("versions");

/// Benchmark results keyed by `{slot_id}:{version_id}:{timestamp}`.
pub const BENCHMARKS: TableDefinition<&str, &[u8]> = TableDefinition::new("benchmarks");

/// A/B sessions keyed by `{slot_id}:{started_at:020}`. Closed, never deleted.
pub const AB_SESSIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("ab_sessions");

/// Open rollback windows keyed by `{slot_id}`.
pub const ROLLBACK_WINDOWS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("rollback_windows");
