//! Capability traits for benchmarking an upstream model.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::corpus::Sample;

/// What a model returned for one sample.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelOutput {
    #[serde(default)]
    pub output: serde_json::Value,
    /// Metrics the adapter already computed against the sample's reference.
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    /// Inference latency as measured by the adapter. The runner measures
    /// the call itself when this is absent.
    #[serde(default)]
    pub latency_ms: Option<f64>,
}

/// An upstream model that can be invoked at a specific version.
#[async_trait]
pub trait ScorableModel: Send + Sync {
    async fn invoke(&self, version_id: &str, sample: &Sample) -> anyhow::Result<ModelOutput>;
}

/// Turns one model output into named metric values.
pub trait Scorer: Send + Sync {
    fn score(&self, sample: &Sample, output: &ModelOutput) -> anyhow::Result<BTreeMap<String, f64>>;
}

/// Uses the metrics reported by the model adapter as-is.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReportedMetrics;

impl Scorer for ReportedMetrics {
    fn score(&self, sample: &Sample, output: &ModelOutput) -> anyhow::Result<BTreeMap<String, f64>> {
        if output.metrics.is_empty() {
            anyhow::bail!("sample {}: model reported no metrics", sample.id);
        }
        if let Some((name, _)) = output.metrics.iter().find(|(_, v)| !v.is_finite()) {
            anyhow::bail!("sample {}: metric {name} is not finite", sample.id);
        }
        Ok(output.metrics.clone())
    }
}
