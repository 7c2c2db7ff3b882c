//! Per-task metric records and run-level aggregates.
//!
//! Every processed sample yields one [`TaskMetrics`] record, appended as a
//! JSON line to `metrics.jsonl`. [`RunSummary`] is computed once over the
//! full record set at the end of a run:
//!
//! - **TGC** (task goal completion) = `passed / total` for one task,
//! - **SGC** (scenario goal completion) = fraction of tasks whose TGC meets
//!   the threshold (0.8 by default).

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::playbook::SharedPlaybook;
use crate::trajectory::TerminationReason;

/// `passed / total`, or 0.0 when the task has no tests.
pub fn tgc(passed: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        passed as f64 / total as f64
    }
}

/// Which driver produced a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Offline,
    Online,
    Evaluation,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Offline => "offline",
            Self::Online => "online",
            Self::Evaluation => "evaluation",
        })
    }
}

/// One sample's outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMetrics {
    pub task_id: String,
    pub phase: Phase,
    /// One-based epoch for offline runs.
    #[serde(default)]
    pub epoch: Option<usize>,
    /// Position of the sample within its epoch or stream.
    pub sample_index: usize,
    pub termination: TerminationReason,
    pub num_steps: usize,
    pub passed_count: usize,
    pub total_count: usize,
    pub tgc: f64,
    pub elapsed_secs: f64,
    /// Live bullets after this sample's write.
    pub playbook_size: usize,
}

// ---------------------------------------------------------------------------
// Streaming log
// ---------------------------------------------------------------------------

/// Append-only JSONL sink for [`TaskMetrics`].
#[derive(Debug)]
pub struct MetricsLog {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl MetricsLog {
    /// Open `path` for appending, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open metrics log {}", path.display()))?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    /// Append one record and flush it.
    pub fn append(&mut self, record: &TaskMetrics) -> Result<()> {
        let line = serde_json::to_string(record).context("Failed to serialize task metrics")?;
        writeln!(self.writer, "{line}")
            .and_then(|_| self.writer.flush())
            .with_context(|| format!("Failed to write {}", self.path.display()))
    }

    /// Read every record from a metrics log.
    pub fn read_all(path: impl AsRef<Path>) -> Result<Vec<TaskMetrics>> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("Failed to open metrics log {}", path.display()))?;
        let mut records = Vec::new();
        for (n, line) in BufReader::new(file).lines().enumerate() {
            let line = line.with_context(|| format!("Failed to read {}", path.display()))?;
            if line.trim().is_empty() {
                continue;
            }
            let record = serde_json::from_str(&line).with_context(|| {
                format!("Malformed metrics record on line {} of {}", n + 1, path.display())
            })?;
            records.push(record);
        }
        Ok(records)
    }
}

// ---------------------------------------------------------------------------
// Run summary
// ---------------------------------------------------------------------------

/// Aggregate statistics over a set of task records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub tasks: usize,
    pub mean_tgc: f64,
    pub sgc: f64,
    pub sgc_threshold: f64,
    pub passed_tests: usize,
    pub total_tests: usize,
    /// Trajectory count per termination reason.
    pub terminations: BTreeMap<String, usize>,
    /// Deduplication passes that failed and were skipped.
    #[serde(default)]
    pub dedup_failures: usize,
    /// Final live bullet count.
    #[serde(default)]
    pub playbook_size: usize,
    /// Input records that could not be parsed and were skipped.
    #[serde(default)]
    pub skipped_samples: usize,
}

impl RunSummary {
    pub fn from_records(records: &[TaskMetrics], sgc_threshold: f64) -> Self {
        let tasks = records.len();
        let mut summary = Self {
            tasks,
            sgc_threshold,
            ..Self::default()
        };
        if tasks == 0 {
            return summary;
        }

        let mut tgc_sum = 0.0;
        let mut meeting = 0;
        for record in records {
            tgc_sum += record.tgc;
            if record.tgc >= sgc_threshold {
                meeting += 1;
            }
            summary.passed_tests += record.passed_count;
            summary.total_tests += record.total_count;
            *summary
                .terminations
                .entry(record.termination.to_string())
                .or_default() += 1;
        }
        summary.mean_tgc = tgc_sum / tasks as f64;
        summary.sgc = meeting as f64 / tasks as f64;
        summary.playbook_size = records.last().map(|r| r.playbook_size).unwrap_or(0);
        summary
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Tasks:          {}", self.tasks)?;
        writeln!(f, "Mean TGC:       {:.3}", self.mean_tgc)?;
        writeln!(f, "SGC (>= {:.2}):  {:.3}", self.sgc_threshold, self.sgc)?;
        writeln!(f, "Unit tests:     {}/{}", self.passed_tests, self.total_tests)?;
        writeln!(f, "Playbook size:  {}", self.playbook_size)?;
        if self.dedup_failures > 0 {
            writeln!(f, "Dedup failures: {}", self.dedup_failures)?;
        }
        if self.skipped_samples > 0 {
            writeln!(f, "Skipped input:  {}", self.skipped_samples)?;
        }
        writeln!(f, "Terminations:")?;
        for (reason, count) in &self.terminations {
            writeln!(f, "  {reason:<20} {count}")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Run bookkeeping
// ---------------------------------------------------------------------------

/// What a driver returns once its input is exhausted or it is stopped.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub records: Vec<TaskMetrics>,
    pub summary: RunSummary,
    /// Steps taken across every sample of the run.
    pub total_steps: usize,
}

/// Collects a run's records and mirrors them to the optional JSONL log.
#[derive(Debug, Default)]
pub(crate) struct RunLog {
    records: Vec<TaskMetrics>,
    sink: Option<MetricsLog>,
    total_steps: usize,
}

impl RunLog {
    /// Log to `<output_dir>/metrics.jsonl` when an output directory is set.
    pub(crate) fn open(output_dir: Option<&Path>) -> Result<Self> {
        let sink = output_dir
            .map(|dir| MetricsLog::open(dir.join("metrics.jsonl")))
            .transpose()?;
        Ok(Self {
            sink,
            ..Self::default()
        })
    }

    pub(crate) fn record(&mut self, metrics: TaskMetrics) {
        self.total_steps += metrics.num_steps;
        if let Some(sink) = &mut self.sink {
            if let Err(e) = sink.append(&metrics) {
                tracing::warn!(task_id = %metrics.task_id, error = %e, "Failed to append metrics");
            }
        }
        self.records.push(metrics);
    }

    pub(crate) fn total_steps(&self) -> usize {
        self.total_steps
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }

    pub(crate) fn finish(
        self,
        sgc_threshold: f64,
        dedup_failures: usize,
        playbook_size: usize,
    ) -> RunReport {
        let mut summary = RunSummary::from_records(&self.records, sgc_threshold);
        summary.dedup_failures = dedup_failures;
        summary.playbook_size = playbook_size;
        RunReport {
            records: self.records,
            summary,
            total_steps: self.total_steps,
        }
    }
}

/// Save `<output_dir>/playbook.json` before a driver gives up on a run.
///
/// A failed save is logged so the error that stopped the run is the one
/// returned.
pub(crate) async fn save_before_abort(playbook: &SharedPlaybook, output_dir: Option<&Path>) {
    let Some(dir) = output_dir else {
        return;
    };
    if let Err(e) = playbook.save_to_file(dir.join("playbook.json")).await {
        tracing::error!(error = %format!("{e:#}"), "Failed to save playbook after an aborted run");
    }
}

/// Write `summary` as pretty JSON to `<output_dir>/<name>`.
pub(crate) fn save_summary(output_dir: &Path, name: &str, summary: &RunSummary) -> Result<()> {
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("Failed to create {}", output_dir.display()))?;
    let path = output_dir.join(name);
    let json = serde_json::to_string_pretty(summary).context("Failed to serialize run summary")?;
    std::fs::write(&path, json)
        .with_context(|| format!("Failed to write run summary to {}", path.display()))?;
    tracing::info!(path = %path.display(), "Run summary saved");
    Ok(())
}
