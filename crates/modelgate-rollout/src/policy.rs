//! Decision policy — pure functions from benchmark and A/B data to outcomes.
//!
//! Nothing here touches storage, clocks, or the network, so identical inputs
//! always produce identical decisions.

use std::collections::BTreeMap;

use serde::Serialize;

use modelgate_core::{AbTestConfig, PolicyConfig};
use modelgate_state::{BenchmarkResult, RunningStats, Variant};

/// Outcome of comparing a candidate benchmark against the active one.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "decision", content = "reason", rename_all = "snake_case")]
pub enum Decision {
    Reject(String),
    Promote(String),
    RunAbTest(String),
}

impl Decision {
    pub fn reason(&self) -> &str {
        match self {
            Decision::Reject(r) | Decision::Promote(r) | Decision::RunAbTest(r) => r,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Decision::Reject(_) => "reject",
            Decision::Promote(_) => "promote",
            Decision::RunAbTest(_) => "ab_test",
        }
    }
}

/// Compare `candidate` against `active`.
///
/// Precedence: absolute limits, then regression tolerances, then a
/// significant improvement on a primary metric with no other metric getting
/// worse, and finally an A/B test for everything in between. Metrics that
/// either side did not report are skipped; a candidate that reports none of
/// the primary metrics is rejected.
pub fn decide(policy: &PolicyConfig, active: &BenchmarkResult, candidate: &BenchmarkResult) -> Decision {
    if let Some(reject) = check_limits(policy, candidate) {
        return reject;
    }

    for rule in &policy.metrics {
        let (Some(base), Some(cand), Some(tol)) = (
            active.metric(&rule.name),
            candidate.metric(&rule.name),
            rule.max_regression,
        ) else {
            continue;
        };
        if tol.exceeded(rule.direction, base, cand) {
            return Decision::Reject(format!(
                "{} regressed from {base:.4} to {cand:.4} beyond tolerance",
                rule.name
            ));
        }
    }

    let mut best: Option<(&str, f64)> = None;
    let mut worsened: Option<&str> = None;
    for rule in &policy.metrics {
        let (Some(base), Some(cand)) = (active.metric(&rule.name), candidate.metric(&rule.name))
        else {
            continue;
        };
        if rule.direction.delta(base, cand) < 0.0 {
            worsened.get_or_insert(rule.name.as_str());
        }
        if rule.primary {
            let rel = rule.direction.relative_improvement(base, cand);
            if best.is_none_or(|(_, b)| rel > b) {
                best = Some((rule.name.as_str(), rel));
            }
        }
    }

    match (best, worsened) {
        (Some((name, rel)), None) if rel >= policy.significant_improvement => Decision::Promote(
            format!(
                "{name} improved {:.1}% (>= {:.1}%) with no regression",
                rel * 100.0,
                policy.significant_improvement * 100.0
            ),
        ),
        (Some((name, rel)), Some(w)) if rel >= policy.significant_improvement => {
            Decision::RunAbTest(format!(
                "{name} improved {:.1}% but {w} got worse",
                rel * 100.0
            ))
        }
        (Some((name, rel)), _) => Decision::RunAbTest(format!(
            "marginal change: best primary metric {name} {:+.1}%",
            rel * 100.0
        )),
        (None, _) => Decision::RunAbTest("no comparable primary metric".to_string()),
    }
}

/// Decision for a slot's first version, which has nothing to compare to.
pub fn decide_bootstrap(policy: &PolicyConfig, candidate: &BenchmarkResult) -> Decision {
    check_limits(policy, candidate)
        .unwrap_or_else(|| Decision::Promote("first version meets minimum quality".to_string()))
}

fn check_limits(policy: &PolicyConfig, candidate: &BenchmarkResult) -> Option<Decision> {
    let reported_primary = policy
        .metrics
        .iter()
        .filter(|r| r.primary)
        .any(|r| candidate.metric(&r.name).is_some());
    if !reported_primary {
        return Some(Decision::Reject("no primary metric reported".to_string()));
    }
    for rule in &policy.metrics {
        if let (Some(value), Some(limit)) = (candidate.metric(&rule.name), rule.limit)
            && !rule.within_limit(value)
        {
            return Some(Decision::Reject(format!(
                "{} = {value:.4} violates limit {limit}",
                rule.name
            )));
        }
    }
    None
}

/// Weighted 0–100 quality score over the scored metrics that were reported.
///
/// Weights of missing metrics are left out of the denominator. `None` if no
/// scored metric is present.
pub fn quality_score(policy: &PolicyConfig, metrics: &BTreeMap<String, f64>) -> Option<f64> {
    let mut total = 0.0;
    let mut weight = 0.0;
    for rule in policy.metrics.iter().filter(|r| r.weight > 0.0) {
        if let Some(n) = metrics.get(&rule.name).and_then(|v| rule.normalized(*v)) {
            total += rule.weight * n;
            weight += rule.weight;
        }
    }
    if weight == 0.0 {
        return None;
    }
    Some((total / weight * 10_000.0).round() / 100.0)
}

/// Result of evaluating an A/B test at its scheduled end.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "conclusion", rename_all = "snake_case")]
pub enum AbConclusion {
    Winner { variant: Variant, reason: String },
    /// Not enough observations yet; extend the window.
    InsufficientData,
}

/// Pick the A/B winner from the primary metric's aggregates.
///
/// With enough samples the better mean wins and ties keep the incumbent.
/// Below the minimum the test is extended once; after that the candidate
/// must beat the incumbent by `insufficient_data_margin` to win.
pub fn conclude_ab(
    cfg: &AbTestConfig,
    a: &RunningStats,
    b: &RunningStats,
    extended: bool,
) -> AbConclusion {
    let min = cfg.min_samples_per_variant;
    let dir = cfg.primary_direction;
    let metric = &cfg.primary_metric;

    if a.count >= min && b.count >= min {
        return if dir.is_better(b.mean, a.mean) {
            AbConclusion::Winner {
                variant: Variant::B,
                reason: format!(
                    "{metric}: candidate {:.4} beat incumbent {:.4} (n={}/{})",
                    b.mean, a.mean, b.count, a.count
                ),
            }
        } else {
            AbConclusion::Winner {
                variant: Variant::A,
                reason: format!(
                    "{metric}: incumbent {:.4} held against candidate {:.4} (n={}/{})",
                    a.mean, b.mean, a.count, b.count
                ),
            }
        };
    }

    if !extended {
        return AbConclusion::InsufficientData;
    }

    if a.count > 0 && b.count > 0 {
        let rel = dir.relative_improvement(a.mean, b.mean);
        if rel > cfg.insufficient_data_margin {
            return AbConclusion::Winner {
                variant: Variant::B,
                reason: format!(
                    "insufficient data (n={}/{}), candidate ahead by {:.1}% on {metric}",
                    b.count,
                    a.count,
                    rel * 100.0
                ),
            };
        }
    }
    AbConclusion::Winner {
        variant: Variant::A,
        reason: format!(
            "insufficient data (n={}/{}), keeping incumbent",
            a.count, b.count
        ),
    }
}
