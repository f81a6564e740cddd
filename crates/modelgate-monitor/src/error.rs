use thiserror::Error;

use modelgate_state::StateError;

pub type FeedResult<T> = Result<T, FeedError>;

#[derive(Debug, Error)]
pub enum FeedError {
    /// Malformed feed entry. Logged and skipped by the monitor.
    #[error("invalid candidate {version:?} for slot {slot}: {reason}")]
    CandidateInvalid {
        slot: String,
        version: String,
        reason: String,
    },

    #[error("version feed unavailable for slot {slot}: {reason}")]
    Fetch { slot: String, reason: String },

    #[error(transparent)]
    Storage(#[from] StateError),
}
