//! Markdown quality report for one slot.

use std::fmt::Write;

use modelgate_state::{ModelSlot, VersionRecord, VersionStatus};

fn status_icon(status: VersionStatus) -> &'static str {
    match status {
        VersionStatus::Active => "✅",
        VersionStatus::Testing => "🧪",
        VersionStatus::Retired => "📦",
        VersionStatus::Rejected => "❌",
        VersionStatus::Candidate => "⏳",
    }
}

/// Render the version history of `slot` as markdown, oldest first.
pub fn render_report(slot: &ModelSlot, history: &[VersionRecord]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Quality Report: {}\n", slot.slot_id);
    let _ = writeln!(
        out,
        "**Active Version:** {}",
        slot.active_version_id.as_deref().unwrap_or("none")
    );
    let _ = writeln!(out, "**State:** {:?}", slot.state);
    let _ = writeln!(out, "**Total Versions:** {}\n", history.len());

    out.push_str("## Version History\n\n");
    for v in history {
        let quality = v
            .quality_score
            .map(|q| format!("{q:.1}"))
            .unwrap_or_else(|| "N/A".to_string());
        let _ = writeln!(
            out,
            "{} **{}** (Quality: {})",
            status_icon(v.status),
            v.version_id,
            quality
        );
        let changelog = if v.changelog.trim().is_empty() {
            "No changelog"
        } else {
            v.changelog.trim()
        };
        let _ = writeln!(out, "   {changelog}");
        if let Some(d) = &v.decision {
            let _ = write!(out, "   _{}: {}", d.outcome, d.reason);
            if let Some(other) = &d.compared_to {
                let _ = write!(out, " (vs {other})");
            }
            out.push_str("_\n");
        }
        out.push('\n');
    }
    out
}
