use thiserror::Error;

pub type BenchResult<T> = Result<T, BenchError>;

#[derive(Debug, Error)]
pub enum BenchError {
    /// Too many sample failures or the run hit its wall-clock cap.
    #[error("benchmark incomplete for {version}: {reason}")]
    Incomplete { version: String, reason: String },

    #[error("benchmark cancelled")]
    Cancelled,

    #[error("corpus error: {0}")]
    Corpus(String),
}

impl BenchError {
    pub fn incomplete(version: &str, reason: impl Into<String>) -> Self {
        BenchError::Incomplete {
            version: version.to_string(),
            reason: reason.into(),
        }
    }
}
