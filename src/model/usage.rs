//! Per-call token accounting for the chat model.
//!
//! Every completion appends one [`LlmCallRecord`] to `llm_calls.jsonl`,
//! tagged with the role, task and step that asked for it. Per-role totals
//! are kept in memory for the end-of-run report.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::api::Usage;

/// Who asked for a completion.
#[derive(Debug, Clone, Copy)]
pub struct CallTag<'a> {
    pub role: &'a str,
    pub task_id: &'a str,
    /// Zero-based generator step; `None` for reflector and curator calls.
    pub step: Option<usize>,
}

/// One chat completion as written to `llm_calls.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmCallRecord {
    pub timestamp: DateTime<Utc>,
    pub task_id: String,
    pub role: String,
    #[serde(default)]
    pub step: Option<usize>,
    pub model: String,
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
    pub elapsed_secs: f64,
}

impl LlmCallRecord {
    pub fn new(tag: CallTag<'_>, model: &str, usage: &Usage, elapsed_secs: f64) -> Self {
        Self {
            timestamp: Utc::now(),
            task_id: tag.task_id.to_string(),
            role: tag.role.to_string(),
            step: tag.step,
            model: model.to_string(),
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
            elapsed_secs,
        }
    }
}

/// Token counts summed over a set of calls.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenTotals {
    pub calls: usize,
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

impl TokenTotals {
    fn add(&mut self, record: &LlmCallRecord) {
        self.calls += 1;
        self.prompt_tokens += record.prompt_tokens;
        self.completion_tokens += record.completion_tokens;
        self.total_tokens += record.total_tokens;
    }
}

#[derive(Debug, Default)]
struct UsageState {
    sink: Option<BufWriter<File>>,
    by_role: BTreeMap<String, TokenTotals>,
}

/// Shared, cloneable call log. The default handle only keeps totals.
#[derive(Debug, Clone, Default)]
pub struct UsageLog {
    state: Arc<Mutex<UsageState>>,
}

impl UsageLog {
    /// Append records to `path`, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open LLM call log {}", path.display()))?;
        let state = UsageState {
            sink: Some(BufWriter::new(file)),
            ..UsageState::default()
        };
        Ok(Self {
            state: Arc::new(Mutex::new(state)),
        })
    }

    /// Count a call and append it to the log, if one is open.
    ///
    /// A failed write is logged and dropped; accounting never fails a call.
    pub fn record(&self, record: &LlmCallRecord) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        state
            .by_role
            .entry(record.role.clone())
            .or_default()
            .add(record);

        if let Some(sink) = &mut state.sink {
            let written = serde_json::to_string(record)
                .map_err(std::io::Error::from)
                .and_then(|line| writeln!(sink, "{line}"))
                .and_then(|_| sink.flush());
            if let Err(e) = written {
                warn!(task_id = %record.task_id, role = %record.role, error = %e, "Failed to log LLM call");
            }
        }
    }

    /// Totals per role, in role order.
    pub fn totals(&self) -> BTreeMap<String, TokenTotals> {
        self.state
            .lock()
            .map(|state| state.by_role.clone())
            .unwrap_or_default()
    }

    /// Read every record from an LLM call log.
    pub fn read_all(path: impl AsRef<Path>) -> Result<Vec<LlmCallRecord>> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("Failed to open LLM call log {}", path.display()))?;
        let mut records = Vec::new();
        for (n, line) in BufReader::new(file).lines().enumerate() {
            let line = line.with_context(|| format!("Failed to read {}", path.display()))?;
            if line.trim().is_empty() {
                continue;
            }
            let record = serde_json::from_str(&line).with_context(|| {
                format!("Malformed LLM call record on line {} of {}", n + 1, path.display())
            })?;
            records.push(record);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(prompt: usize, completion: usize) -> Usage {
        Usage {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: prompt + completion,
        }
    }

    #[test]
    fn test_records_are_tagged_and_appended() {
        let dir = std::env::temp_dir().join(format!("ace_usage_{}", uuid::Uuid::new_v4()));
        let path = dir.join("llm_calls.jsonl");
        let log = UsageLog::open(&path).unwrap();

        let step = CallTag {
            role: "generator",
            task_id: "task-1",
            step: Some(2),
        };
        log.record(&LlmCallRecord::new(step, "gpt-oss:20b", &usage(1200, 300), 0.5));
        let reflect = CallTag {
            role: "reflector",
            task_id: "task-1",
            step: None,
        };
        log.clone()
            .record(&LlmCallRecord::new(reflect, "gpt-oss:20b", &usage(4000, 96), 1.0));

        let records = UsageLog::read_all(&path).unwrap();
        std::fs::remove_dir_all(&dir).ok();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].role, "generator");
        assert_eq!(records[0].step, Some(2));
        assert_eq!(records[0].total_tokens, 1500);
        assert_eq!(records[1].task_id, "task-1");
        assert!(records[1].step.is_none());
    }

    #[test]
    fn test_totals_are_kept_per_role_without_a_file() {
        let log = UsageLog::default();
        let tag = CallTag {
            role: "curator",
            task_id: "t",
            step: None,
        };
        log.record(&LlmCallRecord::new(tag, "m", &usage(10, 5), 0.1));
        log.record(&LlmCallRecord::new(tag, "m", &usage(20, 5), 0.1));

        let totals = log.totals();
        assert_eq!(totals.len(), 1);
        assert_eq!(
            totals["curator"],
            TokenTotals {
                calls: 2,
                prompt_tokens: 30,
                completion_tokens: 10,
                total_tokens: 40,
            }
        );
    }
}
