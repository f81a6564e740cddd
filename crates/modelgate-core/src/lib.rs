pub mod config;
pub mod error;
pub mod metric;

pub use config::{
    AbTestConfig, BenchmarkConfig, ControllerConfig, ControllerSection, FeedConfig, PolicyConfig,
    QualityAlarm, RollbackConfig, SlotConfig,
};
pub use error::{ConfigError, ConfigResult};
pub use metric::{Direction, MetricRule, Tolerance};

/// Identifier of a model slot, e.g. `image-generation`.
pub type SlotId = String;

/// Identifier of one upstream model release within a slot.
pub type VersionId = String;

/// Source of "now" in unix seconds. Tests swap in a manual clock.
pub type Clock = std::sync::Arc<dyn Fn() -> u64 + Send + Sync>;

/// Current unix time in seconds.
pub fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub fn system_clock() -> Clock {
    std::sync::Arc::new(epoch_secs)
}
