//! Per-run report files and the markdown digest of recent runs.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use jobwatch_core::{PostingStatus, RunSummary};
use tokio::fs;

/// Writes `<reports_dir>/<run_id>/run_summary.json` and `daily_brief.md`.
pub async fn write_run_reports(
    reports_dir: &Path,
    summary: &RunSummary,
    status_counts: &[(PostingStatus, usize)],
) -> Result<PathBuf> {
    let run_dir = reports_dir.join(summary.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(run_dir.join("run_summary.json"), json)
        .await
        .context("writing run_summary.json")?;

    fs::write(run_dir.join("daily_brief.md"), render_daily_brief(summary, status_counts))
        .await
        .context("writing daily_brief.md")?;

    Ok(run_dir)
}

pub fn render_daily_brief(summary: &RunSummary, status_counts: &[(PostingStatus, usize)]) -> String {
    let counts = if status_counts.is_empty() {
        "- (store unavailable)".to_string()
    } else {
        status_counts
            .iter()
            .map(|(status, count)| format!("- {status}: {count}"))
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        "# Job Posting Watch Daily Brief\n\n\
         - Run ID: `{}`\n\
         - Status: {}\n\
         - Started: {}\n\
         - Finished: {}\n\
         - Tuples: {}/{}\n\
         - Rows received: {} (dropped {})\n\
         - New postings: {}\n\
         - Re-sighted postings: {} (reopened {})\n\
         - Closed this run: {}\n\
         - Source timeouts: {}\n\
         - Source errors: {}\n\
         - Failed flushes: {}\n\n\
         ## Durations\n\
         - scrape: {} ms\n\
         - finalize: {} ms\n\
         - total: {} ms\n\n\
         ## Postings By Status\n{}\n",
        summary.run_id,
        summary.status.as_str(),
        summary.started_at.to_rfc3339(),
        summary.finished_at.to_rfc3339(),
        summary.tuples_completed,
        summary.tuples_planned,
        summary.rows_received,
        summary.rows_dropped,
        summary.new_postings,
        summary.updated_postings,
        summary.reopened_postings,
        summary.closed_postings,
        summary.source_timeouts,
        summary.source_errors,
        summary.failed_flushes,
        summary.duration_scrape_ms,
        summary.duration_finalize_ms,
        summary.duration_total_ms,
        counts
    )
}

/// Markdown table of run-log rows, newest first as given.
pub fn render_runs_markdown(runs: &[RunSummary]) -> String {
    let mut lines = vec![
        "# Job Posting Watch Runs".to_string(),
        String::new(),
    ];
    if runs.is_empty() {
        lines.push("No runs recorded yet.".to_string());
        return lines.join("\n");
    }

    lines.push("| started | status | tuples | new | re-sighted | closed | total | timeouts | errors | seconds |".to_string());
    lines.push("|---|---|---|---|---|---|---|---|---|---|".to_string());
    for run in runs {
        lines.push(format!(
            "| {} | {} | {}/{} | {} | {} | {} | {} | {} | {} | {:.1} |",
            run.started_at.format("%Y-%m-%d %H:%M"),
            run.status.as_str(),
            run.tuples_completed,
            run.tuples_planned,
            run.new_postings,
            run.updated_postings,
            run.closed_postings,
            run.total_postings,
            run.source_timeouts,
            run.source_errors,
            run.duration_total_ms as f64 / 1000.0
        ));
    }
    lines.join("\n")
}
