//! Prometheus text exposition format.
//!
//! Renders slot state, per-version quality scores, and open A/B aggregates
//! for scraping by a Prometheus server or compatible agent.

use std::fmt::Write;

use modelgate_state::{ModelSlot, VersionRecord};

use crate::aggregator::AbSnapshot;

/// Render the controller's view of every slot into Prometheus text format.
pub fn render_prometheus(
    slots: &[ModelSlot],
    versions: &[VersionRecord],
    ab: &[AbSnapshot],
) -> String {
    let mut out = String::new();

    out.push_str("# HELP modelgate_slot_info Active version and lifecycle state per slot.\n");
    out.push_str("# TYPE modelgate_slot_info gauge\n");
    for s in slots {
        let _ = writeln!(
            out,
            "modelgate_slot_info{{slot=\"{}\",active_version=\"{}\",state=\"{}\"}} 1",
            escape(&s.slot_id),
            escape(s.active_version_id.as_deref().unwrap_or("")),
            state_label(s),
        );
    }

    out.push_str("# HELP modelgate_version_quality_score Benchmark quality score (0-100).\n");
    out.push_str("# TYPE modelgate_version_quality_score gauge\n");
    for v in versions {
        if let Some(score) = v.quality_score {
            let _ = writeln!(
                out,
                "modelgate_version_quality_score{{slot=\"{}\",version=\"{}\",status=\"{}\"}} {:.2}",
                escape(&v.slot_id),
                escape(&v.version_id),
                status_label(v),
                score
            );
        }
    }

    out.push_str("# HELP modelgate_ab_samples Outcome observations per A/B variant.\n");
    out.push_str("# TYPE modelgate_ab_samples gauge\n");
    for line in ab_lines(ab, |s| s.count as f64) {
        let _ = writeln!(out, "modelgate_ab_samples{line}");
    }

    out.push_str("# HELP modelgate_ab_mean Running mean of an outcome metric per A/B variant.\n");
    out.push_str("# TYPE modelgate_ab_mean gauge\n");
    for line in ab_lines(ab, |s| s.mean) {
        let _ = writeln!(out, "modelgate_ab_mean{line}");
    }

    out.push_str("# HELP modelgate_ab_stddev Sample standard deviation per A/B variant.\n");
    out.push_str("# TYPE modelgate_ab_stddev gauge\n");
    for line in ab_lines(ab, |s| s.std_dev()) {
        let _ = writeln!(out, "modelgate_ab_stddev{line}");
    }

    out
}

fn ab_lines(
    ab: &[AbSnapshot],
    value: impl Fn(&modelgate_state::RunningStats) -> f64,
) -> Vec<String> {
    let mut lines = Vec::new();
    for snap in ab {
        for (variant, metrics) in &snap.per_variant {
            for (metric, stats) in metrics {
                lines.push(format!(
                    "{{slot=\"{}\",variant=\"{}\",version=\"{}\",metric=\"{}\"}} {:.4}",
                    escape(&snap.slot_id),
                    variant_label(*variant),
                    escape(snap.version(*variant)),
                    escape(metric),
                    value(stats)
                ));
            }
        }
    }
    lines
}

fn state_label(slot: &ModelSlot) -> &'static str {
    use modelgate_state::SlotState::*;
    match slot.state {
        Idle => "idle",
        Benchmarking => "benchmarking",
        AbTesting => "ab_testing",
        RollbackWindowOpen => "rollback_window_open",
    }
}

fn status_label(v: &VersionRecord) -> &'static str {
    use modelgate_state::VersionStatus::*;
    match v.status {
        Candidate => "candidate",
        Testing => "testing",
        Active => "active",
        Retired => "retired",
        Rejected => "rejected",
    }
}

fn variant_label(v: modelgate_state::Variant) -> &'static str {
    match v {
        modelgate_state::Variant::A => "a",
        modelgate_state::Variant::B => "b",
    }
}

/// Escape a label value per the exposition format.
fn escape(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}
