//! Errors raised by the slot state store.

use thiserror::Error;

pub type StateResult<T> = Result<T, StateError>;

#[derive(Debug, Error)]
pub enum StateError {
    /// The database could not be created, or another process holds its lock.
    #[error("state database unavailable: {0}")]
    Unavailable(#[from] redb::DatabaseError),

    #[error("state transaction failed: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// The transition was not persisted; nothing in its change set applied.
    #[error("state commit failed: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("state table unavailable: {0}")]
    Table(#[from] redb::TableError),

    #[error("state storage failure: {0}")]
    Storage(#[from] redb::StorageError),

    /// A stored slot, version, benchmark, session, or window no longer
    /// decodes as its current type.
    #[error("corrupt {table} record {key}: {source}")]
    CorruptRecord {
        table: String,
        key: String,
        source: serde_json::Error,
    },

    #[error("cannot encode {table} record {key}: {source}")]
    Encode {
        table: String,
        key: String,
        source: serde_json::Error,
    },
}

impl StateError {
    pub(crate) fn corrupt(table: &str, key: &str, source: serde_json::Error) -> Self {
        StateError::CorruptRecord {
            table: table.to_string(),
            key: key.to_string(),
            source,
        }
    }

    pub(crate) fn encode(table: &str, key: &str, source: serde_json::Error) -> Self {
        StateError::Encode {
            table: table.to_string(),
            key: key.to_string(),
            source,
        }
    }
}
