//! Benchmark corpus — a fixed, versioned sample set per slot type.
//!
//! Stored as `{corpus_dir}/{slot_type}.json`:
//!
//! ```json
//! { "version": "2026-01", "samples": [ { "id": "p-001", "input": {...}, "reference": {...} } ] }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{BenchError, BenchResult};

/// One benchmark input with its optional reference output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub id: String,
    pub input: serde_json::Value,
    #[serde(default)]
    pub reference: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Corpus {
    #[serde(default)]
    pub slot_type: String,
    /// Corpus revision, recorded so results from different corpora are not mixed up.
    #[serde(default)]
    pub version: String,
    pub samples: Vec<Sample>,
}

impl Corpus {
    pub fn new(slot_type: &str, samples: Vec<Sample>) -> Self {
        Self {
            slot_type: slot_type.to_string(),
            version: String::new(),
            samples,
        }
    }

    /// Load the corpus for `slot_type` from `dir`.
    pub fn load(dir: &Path, slot_type: &str) -> BenchResult<Self> {
        let path = dir.join(format!("{slot_type}.json"));
        let content = std::fs::read_to_string(&path)
            .map_err(|e| BenchError::Corpus(format!("{}: {e}", path.display())))?;
        let mut corpus: Corpus = serde_json::from_str(&content)
            .map_err(|e| BenchError::Corpus(format!("{}: {e}", path.display())))?;
        if corpus.samples.is_empty() {
            return Err(BenchError::Corpus(format!("{}: no samples", path.display())));
        }
        corpus.slot_type = slot_type.to_string();
        debug!(
            slot_type,
            version = %corpus.version,
            samples = corpus.samples.len(),
            "loaded benchmark corpus"
        );
        Ok(corpus)
    }

    /// The first `n` samples, or all of them if the corpus is smaller.
    pub fn take(&self, n: usize) -> &[Sample] {
        &self.samples[..n.min(self.samples.len())]
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
