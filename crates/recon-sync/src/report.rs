//! Run summaries, the markdown brief, run history and health checks.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use recon_core::BatchResult;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::SourceConfig;
use crate::pipeline::{StreamReport, StreamStatus};

/// A drop larger than this share of the last good run is a health problem.
pub const DROP_THRESHOLD: f64 = 0.5;

const HISTORY_FILE: &str = "history.json";

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub full_refresh: bool,
    pub streams: Vec<StreamReport>,
    /// All streams folded together.
    pub totals: BatchResult,
    pub health: Vec<HealthProblem>,
}

impl RunSummary {
    pub fn new(
        run_id: Uuid,
        started_at: DateTime<Utc>,
        streams: Vec<StreamReport>,
        error_cap: usize,
    ) -> Self {
        let mut totals = BatchResult::default();
        for stream in &streams {
            totals.merge(&stream.batch, error_cap);
        }
        Self {
            run_id,
            started_at,
            finished_at: Utc::now(),
            dry_run: false,
            full_refresh: false,
            streams,
            totals,
            health: Vec::new(),
        }
    }

    /// Records accounted for across all streams: upserted plus unchanged skips.
    pub fn stored(&self) -> usize {
        self.streams.iter().map(stored).sum()
    }

    /// At least one record stored across all streams. Health checks count the same way.
    pub fn success(&self) -> bool {
        self.stored() > 0
    }

    pub fn hard_failures(&self) -> impl Iterator<Item = &StreamReport> {
        self.streams.iter().filter(|s| s.status.is_hard_failure())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthProblem {
    pub source_id: String,
    pub message: String,
}

/// One stream of one past run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub run_id: Uuid,
    pub source_id: String,
    pub finished_at: DateTime<Utc>,
    pub status: String,
    /// Records accounted for this run: upserted plus unchanged skips.
    pub stored: usize,
    pub upserted: usize,
    pub errored: usize,
}

impl HistoryEntry {
    fn from_stream(run_id: Uuid, stream: &StreamReport) -> Self {
        Self {
            run_id,
            source_id: stream.source_id.clone(),
            finished_at: stream.finished_at,
            status: status_label(&stream.status).to_string(),
            stored: stored(stream),
            upserted: stream.batch.upserted,
            errored: stream.batch.errored,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunHistory {
    pub entries: Vec<HistoryEntry>,
}

impl RunHistory {
    pub async fn load(reports_dir: &Path) -> Result<Self> {
        let path = reports_dir.join(HISTORY_FILE);
        match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("parsing {}", path.display())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
        }
    }

    pub async fn save(&self, reports_dir: &Path) -> Result<()> {
        fs::create_dir_all(reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;
        let path = reports_dir.join(HISTORY_FILE);
        let tmp = reports_dir.join(format!(".{HISTORY_FILE}.{}.tmp", Uuid::new_v4()));
        let bytes = serde_json::to_vec_pretty(self).context("serializing run history")?;
        fs::write(&tmp, bytes)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("renaming {} to {}", tmp.display(), path.display()))?;
        Ok(())
    }

    /// Appends the streams of `summary` and keeps only the last `limit` runs.
    pub fn record(&mut self, summary: &RunSummary, limit: usize) {
        self.entries.extend(
            summary
                .streams
                .iter()
                .map(|s| HistoryEntry::from_stream(summary.run_id, s)),
        );

        let mut recent_runs = Vec::new();
        for entry in self.entries.iter().rev() {
            if !recent_runs.contains(&entry.run_id) {
                recent_runs.push(entry.run_id);
            }
        }
        let keep: BTreeSet<Uuid> = recent_runs.into_iter().take(limit.max(1)).collect();
        self.entries.retain(|e| keep.contains(&e.run_id));
    }

    /// Most recent entry for `source_id` that stored anything.
    pub fn last_successful(&self, source_id: &str) -> Option<&HistoryEntry> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.source_id == source_id && e.stored > 0)
    }

    /// Entries grouped by run, newest run first.
    pub fn runs(&self) -> Vec<(Uuid, Vec<&HistoryEntry>)> {
        let mut order = Vec::new();
        let mut grouped: BTreeMap<Uuid, Vec<&HistoryEntry>> = BTreeMap::new();
        for entry in &self.entries {
            if !grouped.contains_key(&entry.run_id) {
                order.push(entry.run_id);
            }
            grouped.entry(entry.run_id).or_default().push(entry);
        }
        order
            .into_iter()
            .rev()
            .filter_map(|run_id| grouped.remove(&run_id).map(|entries| (run_id, entries)))
            .collect()
    }
}

fn stored(stream: &StreamReport) -> usize {
    stream.batch.upserted + stream.unchanged_skipped
}

fn status_label(status: &StreamStatus) -> &'static str {
    match status {
        StreamStatus::Completed => "completed",
        StreamStatus::Partial => "partial",
        StreamStatus::Unavailable(_) => "unavailable",
        StreamStatus::Failed(_) => "failed",
        StreamStatus::InvariantViolation(_) => "invariant_violation",
    }
}

/// Compares each stream against its configured minimum and its last good run.
/// Must be called before the current run is recorded in `history`.
pub fn health_checks(
    summary: &RunSummary,
    sources: &[SourceConfig],
    history: &RunHistory,
) -> Vec<HealthProblem> {
    let mut problems = Vec::new();
    for stream in &summary.streams {
        let mut raise = |message: String| {
            problems.push(HealthProblem {
                source_id: stream.source_id.clone(),
                message,
            })
        };
        let current = stored(stream);

        if current == 0 {
            let detail = match &stream.status {
                StreamStatus::Unavailable(reason)
                | StreamStatus::Failed(reason)
                | StreamStatus::InvariantViolation(reason) => format!(" ({reason})"),
                _ => String::new(),
            };
            raise(format!("nothing persisted{detail}"));
            continue;
        }

        let min_records = sources
            .iter()
            .find(|s| s.source_id == stream.source_id)
            .and_then(|s| s.min_records);
        if let Some(min) = min_records {
            if current < min {
                raise(format!("{current} records persisted, expected at least {min}"));
            }
        }

        if let Some(previous) = history.last_successful(&stream.source_id) {
            if (current as f64) < previous.stored as f64 * DROP_THRESHOLD {
                raise(format!(
                    "{current} records persisted, down from {} in run {}",
                    previous.stored, previous.run_id
                ));
            }
        }
    }
    problems
}

/// Writes `<reports_dir>/<run_id>/run_summary.json` and `brief.md`.
pub async fn write_reports(reports_dir: &Path, summary: &RunSummary) -> Result<PathBuf> {
    let run_dir = reports_dir.join(summary.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(run_dir.join("run_summary.json"), json)
        .await
        .context("writing run_summary.json")?;
    fs::write(run_dir.join("brief.md"), render_brief(summary))
        .await
        .context("writing brief.md")?;
    info!(run_id = %summary.run_id, dir = %run_dir.display(), "reports written");
    Ok(run_dir)
}

pub fn render_brief(summary: &RunSummary) -> String {
    let mut lines = vec![
        "# Sync Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Started: {}", summary.started_at),
        format!("- Finished: {}", summary.finished_at),
    ];
    if summary.dry_run {
        lines.push("- Dry run: nothing was stored".to_string());
    }
    lines.push(format!(
        "- Records: {} attempted, {} upserted, {} rejected, {} errored",
        summary.totals.attempted,
        summary.totals.upserted,
        summary.totals.rejected,
        summary.totals.errored
    ));
    lines.push(String::new());
    lines.push("## Streams".to_string());
    lines.push(String::new());
    lines.push("| source | status | fetched | new | active | expired | upserted | rejected | errored |".to_string());
    lines.push("|---|---|---|---|---|---|---|---|---|".to_string());
    for s in &summary.streams {
        lines.push(format!(
            "| {} | {} | {} | {} | {} | {} | {} | {} | {} |",
            s.source_id,
            status_label(&s.status),
            s.fetched,
            s.reconciliation.new,
            s.reconciliation.still_active,
            s.reconciliation.expired,
            s.batch.upserted,
            s.batch.rejected,
            s.batch.errored
        ));
    }

    if !summary.health.is_empty() {
        lines.push(String::new());
        lines.push("## Health".to_string());
        lines.push(String::new());
        for problem in &summary.health {
            lines.push(format!("- {}: {}", problem.source_id, problem.message));
        }
    }

    let errors: Vec<_> = summary
        .streams
        .iter()
        .flat_map(|s| s.batch.error_messages.iter().map(move |m| (s, m)))
        .take(20)
        .collect();
    if !errors.is_empty() {
        lines.push(String::new());
        lines.push("## First errors".to_string());
        lines.push(String::new());
        for (stream, message) in errors {
            lines.push(format!("- {}: {}", stream.source_id, message));
        }
    }
    lines.push(String::new());
    lines.join("\n")
}

/// Markdown overview of the last `runs` runs from the history file.
pub async fn report_markdown(reports_dir: &Path, runs: usize) -> Result<String> {
    let history = RunHistory::load(reports_dir).await?;
    let mut lines = vec!["# Sync Report".to_string(), String::new()];
    if history.entries.is_empty() {
        warn!(dir = %reports_dir.display(), "no run history yet");
        lines.push("No runs recorded yet.".to_string());
    }
    for (run_id, entries) in history.runs().into_iter().take(runs.max(1)) {
        lines.push(format!("## Run `{run_id}`"));
        for entry in entries {
            lines.push(format!(
                "- {}: {} ({} stored, {} upserted, {} errored)",
                entry.source_id, entry.status, entry.stored, entry.upserted, entry.errored
            ));
        }
        let brief = reports_dir.join(run_id.to_string()).join("brief.md");
        if brief.exists() {
            lines.push(format!("- brief: `{}`", brief.display()));
        }
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}
