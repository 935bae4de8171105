//! Text summaries for the run, bump-version, extract-configs and
//! update-plugins commands
//!
//! Results go to stdout; logs stay on stderr.

use crate::commands::extract_configs::RoleSeed;
use console::style;
use mcprep_core::bump::BumpOutcome;
use mcprep_core::patch::PatchOutcome;
use mcprep_core::pipeline::PipelineReport;
use mcprep_core::plugin_update::{PluginUpdate, UpdateStatus};

fn ok() -> String {
    style("[OK]").green().to_string()
}

fn skipped() -> String {
    style("[--]").yellow().to_string()
}

fn failed() -> String {
    style("[X]").red().to_string()
}

/// Render a finished pipeline run
pub fn render_report(report: &PipelineReport) -> String {
    let mut output = String::new();

    output.push_str(&format!(
        "{}\n",
        style(format!("Run {} ({})", report.run_id, report.image)).bold()
    ));

    for name in &report.created {
        output.push_str(&format!("  {} created {}\n", ok(), name));
    }
    for record in &report.readiness {
        output.push_str(&format!(
            "  {} {} ready after {} check(s) ({} ms)\n",
            ok(),
            record.instance,
            record.attempts,
            record.elapsed_ms
        ));
    }

    if let Some(batch) = &report.commands {
        let icon = if batch.is_success() { ok() } else { failed() };
        output.push_str(&format!(
            "  {} {}/{} command(s) accepted by {}\n",
            icon,
            batch.responses.len(),
            batch.attempted(),
            batch.target
        ));
        for failure in &batch.failures {
            output.push_str(&format!("      {}\n", style(failure).red()));
        }
    }

    for record in &report.extracted {
        output.push_str(&format!(
            "  {} {}:{} -> {}\n",
            ok(),
            record.instance,
            record.source,
            record.destination.display()
        ));
    }

    for record in &report.patches {
        let icon = match record.outcome {
            PatchOutcome::Applied => ok(),
            PatchOutcome::Unchanged | PatchOutcome::Skipped => skipped(),
        };
        let outcome = match record.outcome {
            PatchOutcome::Applied => "patched",
            PatchOutcome::Unchanged => "unchanged",
            PatchOutcome::Skipped => "missing",
        };
        output.push_str(&format!(
            "  {} {} {}\n",
            icon,
            outcome,
            record.file.display()
        ));
    }

    if let Some(summary) = &report.permissions {
        output.push_str(&format!(
            "  {} normalized {} file(s) and {} directories\n",
            ok(),
            summary.files,
            summary.directories
        ));
    }

    for skip in &report.skipped {
        output.push_str(&format!(
            "  {} {} skipped ({})\n",
            skipped(),
            skip.stage,
            style(&skip.reason).italic()
        ));
    }

    for failure in &report.failures {
        output.push_str(&format!(
            "  {} {}: {}\n",
            failed(),
            style(failure.stage).red().bold(),
            failure.message
        ));
    }

    output.push_str(&format!("  removed: {}\n", report.removed.join(", ")));

    if report.interrupted {
        output.push_str(&format!("{}\n", style("Run interrupted").red().bold()));
    } else if report.is_success() {
        output.push_str(&format!("{}\n", style("Run succeeded").green()));
    } else {
        let stages: Vec<&str> = report.failed_stages().iter().map(|s| s.as_str()).collect();
        output.push_str(&format!(
            "{}\n",
            style(format!("Run failed in: {}", stages.join(", "))).red().bold()
        ));
    }

    output
}

/// Render the result of a version bump
pub fn render_bump(old: &str, new: &str, outcome: &BumpOutcome) -> String {
    let mut output = format!("{}\n", style(format!("Version {} -> {}", old, new)).bold());

    for file in &outcome.updated {
        output.push_str(&format!("  {} updated {}\n", ok(), file.display()));
    }
    for file in &outcome.unchanged {
        output.push_str(&format!("  {} no match in {}\n", skipped(), file.display()));
    }
    for file in &outcome.missing {
        output.push_str(&format!("  {} missing {}\n", skipped(), file.display()));
    }
    if outcome.committed {
        output.push_str(&format!("  {} committed\n", ok()));
    }
    if outcome.tagged {
        output.push_str(&format!("  {} tagged {}\n", ok(), new));
    }

    output
}

/// Render the seeding result for one role
pub fn render_seed(result: &RoleSeed) -> String {
    let mut output = format!(
        "{}\n",
        style(format!(
            "{} plugins ({})",
            result.role,
            result.plugins_dir.display()
        ))
        .bold()
    );

    let summary = &result.summary;
    if summary.seeded.is_empty() && summary.skipped.is_empty() && summary.failed.is_empty() {
        output.push_str(&format!("  {} no plugin jars found\n", skipped()));
    }
    for plugin in &summary.seeded {
        output.push_str(&format!(
            "  {} {}: {} file(s)\n",
            ok(),
            plugin.name,
            plugin.files.len()
        ));
    }
    for name in &summary.skipped {
        output.push_str(&format!("  {} {} configures itself\n", skipped(), name));
    }
    for (jar, reason) in &summary.failed {
        output.push_str(&format!("  {} {}: {}\n", failed(), jar.display(), reason));
    }

    output
}

/// Render one line per plugin and target
pub fn render_updates(updates: &[PluginUpdate]) -> String {
    let mut output = format!("{}\n", style("Plugins").bold());
    if updates.is_empty() {
        output.push_str(&format!("  {} no enabled plugins\n", skipped()));
    }

    for update in updates {
        let subject = format!("{}/{}", update.target, update.plugin);
        let line = match &update.status {
            UpdateStatus::Installed { version } => format!("{} {} installed {}", ok(), subject, version),
            UpdateStatus::Updated { from, to } => format!("{} {} updated {} -> {}", ok(), subject, from, to),
            UpdateStatus::UpToDate { version } => format!("{} {} up to date ({})", skipped(), subject, version),
            UpdateStatus::Available { from: Some(from), to } => {
                format!("{} {} update available {} -> {}", skipped(), subject, from, to)
            }
            UpdateStatus::Available { from: None, to } => {
                format!("{} {} not installed, {} available", skipped(), subject, to)
            }
            UpdateStatus::NoUrl => format!("{} {} has no download URL", skipped(), subject),
            UpdateStatus::Failed { reason } => format!("{} {}: {}", failed(), subject, reason),
        };
        output.push_str(&format!("  {}\n", line));
    }

    output
}
