//! modelgate-bench — off-path quality benchmarks for model versions.
//!
//! The runner invokes a [`ScorableModel`] once per corpus sample on a
//! bounded worker pool, scores every output with a [`Scorer`], and folds
//! the per-sample metrics into a [`BenchmarkResult`](modelgate_state::BenchmarkResult).
//! A run is incomplete when too many samples fail, when it exceeds its
//! wall-clock cap, or when it is cancelled by an operator.

pub mod corpus;
pub mod error;
pub mod http_model;
pub mod model;
pub mod runner;

pub use corpus::{Corpus, Sample};
pub use error::{BenchError, BenchResult};
pub use http_model::HttpModel;
pub use model::{ModelOutput, ReportedMetrics, ScorableModel, Scorer};
pub use runner::{BenchPair, BenchmarkRunner};
