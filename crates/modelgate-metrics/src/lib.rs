//! modelgate-metrics — outcome aggregation and export.
//!
//! Tracks per-variant running aggregates for each slot's open A/B test,
//! watches the promoted version while a rollback window is open, and
//! renders slot state for external observability.
//!
//! # Architecture
//!
//! ```text
//! MetricsAggregator
//!   ├── begin_session() ← state machine opens an A/B test
//!   ├── record()        ← serving layer reports an outcome
//!   ├── snapshot()      → state machine reads aggregates at conclusion
//!   └── watch()         ← post-promotion quality alarm tracking
//!
//! Export
//!   ├── render_prometheus() → text/plain for /metrics
//!   └── render_report()     → markdown quality report per slot
//! ```

pub mod aggregator;
pub mod prometheus;
pub mod report;

pub use aggregator::{AbSnapshot, MetricsAggregator, Recorded, WatchSnapshot};
pub use prometheus::render_prometheus;
pub use report::render_report;
