//! Benchmark runner — evaluates a corpus against one or two versions.
//!
//! Samples run concurrently on a semaphore-bounded pool. `run_pair`
//! benchmarks the candidate and the current active version under one
//! wall-clock cap so both results come from the same corpus and conditions.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use modelgate_core::metric::MEAN_LATENCY_MS;
use modelgate_core::BenchmarkConfig;
use modelgate_state::{BenchmarkResult, RunningStats};

use crate::corpus::{Corpus, Sample};
use crate::error::{BenchError, BenchResult};
use crate::model::{ScorableModel, Scorer};

/// Results of benchmarking a candidate against the active version.
#[derive(Debug, Clone)]
pub struct BenchPair {
    /// `None` when the slot has no active version yet.
    pub active: Option<BenchmarkResult>,
    pub candidate: BenchmarkResult,
}

#[derive(Clone)]
pub struct BenchmarkRunner {
    model: Arc<dyn ScorableModel>,
    scorer: Arc<dyn Scorer>,
}

impl BenchmarkRunner {
    pub fn new(model: Arc<dyn ScorableModel>, scorer: Arc<dyn Scorer>) -> Self {
        Self { model, scorer }
    }

    /// Benchmark `candidate` and then `active` on the same corpus.
    ///
    /// Fails with `Incomplete` if either run has too many failed samples or
    /// the pair exceeds `config.timeout()`, and with `Cancelled` as soon as
    /// `cancel` flips to `true`.
    pub async fn run_pair(
        &self,
        slot_id: &str,
        active: Option<&str>,
        candidate: &str,
        corpus: &Corpus,
        config: &BenchmarkConfig,
        now: u64,
        cancel: watch::Receiver<bool>,
    ) -> BenchResult<BenchPair> {
        let work = async {
            let candidate = self.run(slot_id, candidate, corpus, config, now).await?;
            let active = match active {
                Some(version) => Some(self.run(slot_id, version, corpus, config, now).await?),
                None => None,
            };
            Ok(BenchPair { active, candidate })
        };

        tokio::select! {
            biased;
            _ = cancelled(cancel) => {
                warn!(slot = %slot_id, version = %candidate, "benchmark cancelled");
                Err(BenchError::Cancelled)
            }
            res = tokio::time::timeout(config.timeout(), work) => match res {
                Ok(pair) => pair,
                Err(_) => {
                    warn!(
                        slot = %slot_id,
                        version = %candidate,
                        timeout_secs = config.timeout_secs,
                        "benchmark timed out"
                    );
                    Err(BenchError::incomplete(
                        candidate,
                        format!("timed out after {}s", config.timeout_secs),
                    ))
                }
            },
        }
    }

    /// Benchmark one version. No wall-clock cap is applied here.
    pub async fn run(
        &self,
        slot_id: &str,
        version_id: &str,
        corpus: &Corpus,
        config: &BenchmarkConfig,
        now: u64,
    ) -> BenchResult<BenchmarkResult> {
        let samples = corpus.take(config.sample_count);
        if samples.is_empty() {
            return Err(BenchError::Corpus(format!(
                "corpus {} has no samples",
                corpus.slot_type
            )));
        }
        if samples.len() < config.sample_count {
            debug!(
                slot = %slot_id,
                wanted = config.sample_count,
                available = samples.len(),
                "corpus smaller than configured sample count"
            );
        }

        let started = Instant::now();
        let semaphore = Arc::new(Semaphore::new(config.concurrency.max(1)));
        let mut tasks = JoinSet::new();

        for sample in samples {
            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .map_err(|_| BenchError::Cancelled)?;
            let model = Arc::clone(&self.model);
            let scorer = Arc::clone(&self.scorer);
            let version = version_id.to_string();
            let sample = sample.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let result = evaluate(model.as_ref(), scorer.as_ref(), &version, &sample).await;
                (sample.id, result)
            });
        }

        let mut stats: BTreeMap<String, RunningStats> = BTreeMap::new();
        let mut scored = 0usize;
        let mut failed = 0usize;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(metrics))) => {
                    scored += 1;
                    for (name, value) in metrics {
                        stats.entry(name).or_default().push(value);
                    }
                }
                Ok((sample_id, Err(e))) => {
                    failed += 1;
                    debug!(slot = %slot_id, version = %version_id, sample = %sample_id, error = %e, "sample failed");
                }
                Err(e) => {
                    failed += 1;
                    debug!(slot = %slot_id, version = %version_id, error = %e, "sample task aborted");
                }
            }
        }

        let total = samples.len();
        if scored == 0 || failed as f64 > config.max_failure_fraction * total as f64 {
            warn!(
                slot = %slot_id,
                version = %version_id,
                failed,
                total,
                "too many benchmark samples failed"
            );
            return Err(BenchError::incomplete(
                version_id,
                format!("{failed}/{total} samples failed"),
            ));
        }

        let metrics = stats.into_iter().map(|(k, s)| (k, s.mean)).collect();
        let duration_ms = started.elapsed().as_millis() as u64;
        info!(
            slot = %slot_id,
            version = %version_id,
            scored,
            failed,
            duration_ms,
            "benchmark complete"
        );
        Ok(BenchmarkResult {
            slot_id: slot_id.to_string(),
            version_id: version_id.to_string(),
            sample_count: scored,
            failed_count: failed,
            metrics,
            timestamp: now,
            duration_ms,
        })
    }
}

async fn evaluate(
    model: &dyn ScorableModel,
    scorer: &dyn Scorer,
    version: &str,
    sample: &Sample,
) -> anyhow::Result<BTreeMap<String, f64>> {
    let started = Instant::now();
    let output = model.invoke(version, sample).await?;
    let mut metrics = scorer.score(sample, &output)?;
    let latency = output
        .latency_ms
        .unwrap_or_else(|| started.elapsed().as_secs_f64() * 1000.0);
    metrics.entry(MEAN_LATENCY_MS.to_string()).or_insert(latency);
    Ok(metrics)
}

/// Resolves once `rx` reads `true`; never resolves if the sender is gone.
async fn cancelled(mut rx: watch::Receiver<bool>) {
    if rx.wait_for(|c| *c).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::model::{ModelOutput, ReportedMetrics};

    /// Deterministic model: psnr depends on the version, every `fail_every`th
    /// sample errors.
    struct FakeModel {
        fail_every: usize,
        delay: Duration,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl FakeModel {
        fn new(fail_every: usize, delay: Duration) -> Self {
            Self {
                fail_every,
                delay,
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ScorableModel for FakeModel {
        async fn invoke(&self, version_id: &str, sample: &Sample) -> anyhow::Result<ModelOutput> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let idx: usize = sample.id.parse()?;
            if self.fail_every > 0 && idx % self.fail_every == 0 {
                anyhow::bail!("upstream 500");
            }
            let psnr = if version_id == "v2" { 36.0 } else { 35.0 };
            Ok(ModelOutput {
                output: serde_json::Value::Null,
                metrics: BTreeMap::from([("psnr_db".to_string(), psnr)]),
                latency_ms: Some(100.0),
            })
        }
    }

    fn corpus(n: usize) -> Corpus {
        Corpus::new(
            "image_generation",
            (0..n)
                .map(|i| Sample {
                    id: i.to_string(),
                    input: serde_json::json!({ "prompt": format!("p{i}") }),
                    reference: None,
                })
                .collect(),
        )
    }

    fn runner(model: Arc<FakeModel>) -> BenchmarkRunner {
        BenchmarkRunner::new(model, Arc::new(ReportedMetrics))
    }

    fn config(sample_count: usize, concurrency: usize) -> BenchmarkConfig {
        BenchmarkConfig {
            sample_count,
            concurrency,
            ..BenchmarkConfig::default()
        }
    }

    #[tokio::test]
    async fn means_over_scored_samples() {
        let model = Arc::new(FakeModel::new(0, Duration::ZERO));
        let result = runner(model)
            .run("img", "v2", &corpus(10), &config(10, 4), 42)
            .await
            .unwrap();
        assert_eq!(result.sample_count, 10);
        assert_eq!(result.failed_count, 0);
        assert_eq!(result.metric("psnr_db"), Some(36.0));
        assert_eq!(result.metric(MEAN_LATENCY_MS), Some(100.0));
        assert_eq!(result.timestamp, 42);
    }

    #[tokio::test]
    async fn tolerates_failures_under_threshold() {
        // Samples 0 and 10 and 20 ... fail: 10% of 100, exactly at the limit.
        let model = Arc::new(FakeModel::new(10, Duration::ZERO));
        let result = runner(model)
            .run("img", "v1", &corpus(100), &config(100, 8), 0)
            .await
            .unwrap();
        assert_eq!(result.failed_count, 10);
        assert_eq!(result.sample_count, 90);
    }

    #[tokio::test]
    async fn too_many_failures_is_incomplete() {
        // Every 5th sample fails: 20% > 10%.
        let model = Arc::new(FakeModel::new(5, Duration::ZERO));
        let err = runner(model)
            .run("img", "v1", &corpus(100), &config(100, 8), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, BenchError::Incomplete { .. }));
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let model = Arc::new(FakeModel::new(0, Duration::from_millis(5)));
        runner(Arc::clone(&model))
            .run("img", "v1", &corpus(20), &config(20, 3), 0)
            .await
            .unwrap();
        assert!(model.max_in_flight.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn pair_runs_both_versions() {
        let model = Arc::new(FakeModel::new(0, Duration::ZERO));
        let (_tx, rx) = watch::channel(false);
        let pair = runner(model)
            .run_pair("img", Some("v1"), "v2", &corpus(5), &config(5, 2), 7, rx)
            .await
            .unwrap();
        assert_eq!(pair.candidate.metric("psnr_db"), Some(36.0));
        assert_eq!(pair.active.unwrap().metric("psnr_db"), Some(35.0));
    }

    #[tokio::test(start_paused = true)]
    async fn pair_times_out_as_incomplete() {
        let model = Arc::new(FakeModel::new(0, Duration::from_secs(3 * 3600)));
        let (_tx, rx) = watch::channel(false);
        let err = runner(model)
            .run_pair("img", Some("v1"), "v2", &corpus(2), &config(2, 2), 0, rx)
            .await
            .unwrap_err();
        match err {
            BenchError::Incomplete { version, reason } => {
                assert_eq!(version, "v2");
                assert!(reason.contains("timed out"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_run() {
        let model = Arc::new(FakeModel::new(0, Duration::from_secs(600)));
        let (tx, rx) = watch::channel(false);
        let r = runner(model);
        let handle = tokio::spawn(async move {
            r.run_pair("img", None, "v2", &corpus(4), &config(4, 1), 0, rx).await
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        tx.send(true).unwrap();
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, BenchError::Cancelled));
    }
}
