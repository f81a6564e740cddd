//! Metric rules — direction, absolute limits, regression tolerances, and
//! quality-score weighting for one tracked benchmark metric.

use serde::{Deserialize, Serialize};

pub const PSNR_DB: &str = "psnr_db";
pub const SSIM: &str = "ssim";
pub const LPIPS: &str = "lpips";
pub const FID: &str = "fid";
pub const MEAN_LATENCY_MS: &str = "mean_latency_ms";
pub const QUALITY_SCORE: &str = "quality_score";

/// Which way a metric improves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    HigherIsBetter,
    LowerIsBetter,
}

impl Direction {
    /// Signed change from `baseline` to `candidate`; positive means better.
    pub fn delta(self, baseline: f64, candidate: f64) -> f64 {
        match self {
            Direction::HigherIsBetter => candidate - baseline,
            Direction::LowerIsBetter => baseline - candidate,
        }
    }

    /// `delta` relative to the magnitude of the baseline.
    ///
    /// A zero baseline yields `0.0` for no change and `±INFINITY` otherwise.
    pub fn relative_improvement(self, baseline: f64, candidate: f64) -> f64 {
        let delta = self.delta(baseline, candidate);
        if baseline == 0.0 {
            if delta == 0.0 {
                0.0
            } else {
                f64::INFINITY.copysign(delta)
            }
        } else {
            delta / baseline.abs()
        }
    }

    /// True if `a` is strictly better than `b`.
    pub fn is_better(self, a: f64, b: f64) -> bool {
        self.delta(b, a) > 0.0
    }
}

/// How much a metric may worsen relative to the active version before the
/// candidate is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Tolerance {
    /// Maximum worsening in the metric's own unit (e.g. 1.0 dB).
    Absolute(f64),
    /// Maximum worsening as a fraction of the baseline (e.g. 0.20 = 20%).
    Relative(f64),
}

impl Tolerance {
    /// True if moving from `baseline` to `candidate` worsens the metric by
    /// more than this tolerance.
    pub fn exceeded(self, direction: Direction, baseline: f64, candidate: f64) -> bool {
        let worsening = -direction.delta(baseline, candidate);
        if worsening <= 0.0 {
            return false;
        }
        match self {
            Tolerance::Absolute(max) => worsening > max,
            Tolerance::Relative(frac) => worsening > frac * baseline.abs(),
        }
    }

    pub(crate) fn is_valid(self) -> bool {
        match self {
            Tolerance::Absolute(v) | Tolerance::Relative(v) => v.is_finite() && v >= 0.0,
        }
    }
}

/// Gate and scoring rule for one named metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRule {
    pub name: String,
    pub direction: Direction,
    /// Primary quality metrics drive promotion and A/B winner selection.
    #[serde(default)]
    pub primary: bool,
    /// Absolute limit: minimum for higher-is-better, maximum for lower-is-better.
    #[serde(default)]
    pub limit: Option<f64>,
    #[serde(default)]
    pub max_regression: Option<Tolerance>,
    /// Weight of this metric in the 0–100 quality score. Zero excludes it.
    #[serde(default)]
    pub weight: f64,
    /// Normalisation scale for the quality score.
    #[serde(default)]
    pub scale: Option<f64>,
}

impl MetricRule {
    pub fn new(name: &str, direction: Direction) -> Self {
        Self {
            name: name.to_string(),
            direction,
            primary: false,
            limit: None,
            max_regression: None,
            weight: 0.0,
            scale: None,
        }
    }

    pub fn primary(mut self) -> Self {
        self.primary = true;
        self
    }

    pub fn limit(mut self, limit: f64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn max_regression(mut self, tolerance: Tolerance) -> Self {
        self.max_regression = Some(tolerance);
        self
    }

    pub fn scored(mut self, weight: f64, scale: f64) -> Self {
        self.weight = weight;
        self.scale = Some(scale);
        self
    }

    /// True if `value` satisfies the absolute limit (or there is none).
    pub fn within_limit(&self, value: f64) -> bool {
        match (self.limit, self.direction) {
            (None, _) => true,
            (Some(min), Direction::HigherIsBetter) => value >= min,
            (Some(max), Direction::LowerIsBetter) => value <= max,
        }
    }

    /// Map `value` onto `[0, 1]` (1 = best) for the quality score.
    pub fn normalized(&self, value: f64) -> Option<f64> {
        let scale = self.scale.filter(|s| *s > 0.0)?;
        let ratio = (value / scale).clamp(0.0, 1.0);
        Some(match self.direction {
            Direction::HigherIsBetter => ratio,
            Direction::LowerIsBetter => 1.0 - ratio,
        })
    }
}

/// Default rule set for image-generation slots.
pub fn default_rules() -> Vec<MetricRule> {
    vec![
        MetricRule::new(PSNR_DB, Direction::HigherIsBetter)
            .primary()
            .limit(30.0)
            .max_regression(Tolerance::Absolute(1.0))
            .scored(0.25, 40.0),
        MetricRule::new(SSIM, Direction::HigherIsBetter)
            .primary()
            .limit(0.85)
            .max_regression(Tolerance::Absolute(0.02))
            .scored(0.25, 1.0),
        MetricRule::new(LPIPS, Direction::LowerIsBetter)
            .limit(0.15)
            .max_regression(Tolerance::Absolute(0.02))
            .scored(0.25, 0.3),
        MetricRule::new(FID, Direction::LowerIsBetter)
            .limit(20.0)
            .max_regression(Tolerance::Absolute(2.0))
            .scored(0.15, 30.0),
        MetricRule::new(MEAN_LATENCY_MS, Direction::LowerIsBetter)
            .limit(5000.0)
            .max_regression(Tolerance::Relative(0.20))
            .scored(0.10, 10_000.0),
    ]
}
