use thiserror::Error;

use modelgate_core::ConfigError;
use modelgate_monitor::FeedError;
use modelgate_state::StateError;

pub type ControlResult<T> = Result<T, ControlError>;

/// Operator-visible failures. Everything else is absorbed by the controller.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    /// The rollback target can no longer be served. The slot stays on its
    /// current active version.
    #[error("rollback unavailable for slot {slot}: {version} is not servable ({reason})")]
    RollbackUnavailable {
        slot: String,
        version: String,
        reason: String,
    },

    #[error("storage failure: {0}")]
    Storage(#[from] StateError),

    /// A collaborator (version feed) could not be reached.
    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl ControlError {
    /// Stable result code for the operator surface.
    pub fn code(&self) -> &'static str {
        match self {
            ControlError::NotFound(_) => "not_found",
            ControlError::InvalidTransition(_) => "invalid_transition",
            ControlError::RollbackUnavailable { .. } => "fatal",
            ControlError::Storage(_) => "storage",
            ControlError::Unavailable(_) => "unavailable",
            ControlError::Config(_) => "config",
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        ControlError::InvalidTransition(msg.into())
    }
}

impl From<FeedError> for ControlError {
    fn from(e: FeedError) -> Self {
        match e {
            FeedError::Storage(e) => ControlError::Storage(e),
            other => ControlError::Unavailable(other.to_string()),
        }
    }
}
