//! Core trajectory data types.
//!
//! A [`Sample`] is one task instance; a [`Trajectory`] is the ordered record
//! of one attempt at it.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::env::Observation;

/// Per-sample key-value fields handed to the generator (e.g. the
/// supervisor's name and email).
pub type SampleContext = BTreeMap<String, String>;

// ---------------------------------------------------------------------------
// Samples
// ---------------------------------------------------------------------------

/// One task instance. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub task_id: String,
    /// The task instruction shown to the generator.
    pub instruction: String,
    #[serde(default)]
    pub metadata: SampleContext,
    /// Reference solution, available for training splits only.
    #[serde(default)]
    pub ground_truth: Option<String>,
    /// Prior context for the task, if any.
    #[serde(default)]
    pub context: Option<String>,
}

impl Sample {
    pub fn new(task_id: impl Into<String>, instruction: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            instruction: instruction.into(),
            metadata: SampleContext::new(),
            ground_truth: None,
            context: None,
        }
    }
}

/// Load samples from a JSON array file or a JSON-lines file (`.jsonl`).
pub fn load_samples(path: impl AsRef<Path>) -> Result<Vec<Sample>> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read samples from {}", path.display()))?;

    let samples: Vec<Sample> = if path.extension().is_some_and(|ext| ext == "jsonl") {
        text.lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(n, line)| {
                serde_json::from_str(line).with_context(|| {
                    format!("Failed to parse sample on line {} of {}", n + 1, path.display())
                })
            })
            .collect::<Result<_>>()?
    } else {
        serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse samples from {}", path.display()))?
    };

    tracing::info!(path = %path.display(), samples = samples.len(), "Loaded samples");
    Ok(samples)
}

// ---------------------------------------------------------------------------
// Steps and trajectories
// ---------------------------------------------------------------------------

/// One generate/execute/observe iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Zero-based position within the trajectory.
    pub index: usize,
    pub reasoning: String,
    pub code: String,
    pub observation: Observation,
}

/// Why a trajectory stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// The environment reported the task complete.
    Completed,
    /// The step cap was reached first.
    MaxStepsReached,
    /// The session became unusable or the generator failed.
    ExecutionFatal,
}

impl TerminationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::MaxStepsReached => "max_steps_reached",
            Self::ExecutionFatal => "execution_fatal",
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The full record of one attempt at a sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trajectory {
    /// Unique identifier (UUID v4).
    pub id: String,
    pub task_id: String,
    pub steps: Vec<Step>,
    pub termination: TerminationReason,
}

impl Trajectory {
    /// A trajectory for a session that never opened: no steps, fatal.
    pub fn unstarted(task_id: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: task_id.into(),
            steps: Vec::new(),
            termination: TerminationReason::ExecutionFatal,
        }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Code of the last step that produced any, or an empty string.
    ///
    /// A step recorded for a failed generation carries no code and is skipped.
    pub fn final_code(&self) -> &str {
        self.steps
            .iter()
            .rev()
            .map(|s| s.code.as_str())
            .find(|code| !code.trim().is_empty())
            .unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_jsonl_samples() {
        let path = std::env::temp_dir().join(format!("ace_samples_{}.jsonl", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            concat!(
                r#"{"task_id": "a1", "instruction": "Count songs", "metadata": {"email": "j@x.com"}}"#,
                "\n\n",
                r#"{"task_id": "a2", "instruction": "Pay bill", "ground_truth": "apis.pay()"}"#,
                "\n"
            ),
        )
        .unwrap();

        let samples = load_samples(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].metadata["email"], "j@x.com");
        assert_eq!(samples[1].ground_truth.as_deref(), Some("apis.pay()"));
        assert!(samples[1].context.is_none());
    }

    #[test]
    fn test_final_code_skips_codeless_last_step() {
        let step = |index: usize, code: &str| Step {
            index,
            reasoning: String::new(),
            code: code.into(),
            observation: Observation::Fatal("generator failed".into()),
        };
        let trajectory = Trajectory {
            id: "t".into(),
            task_id: "task".into(),
            steps: vec![step(0, "print(1)"), step(1, "print(2)"), step(2, "")],
            termination: TerminationReason::ExecutionFatal,
        };
        assert_eq!(trajectory.final_code(), "print(2)");

        let empty = Trajectory {
            steps: vec![],
            ..trajectory
        };
        assert_eq!(empty.final_code(), "");
    }

    #[test]
    fn test_termination_reason_serializes_snake_case() {
        let json = serde_json::to_string(&TerminationReason::MaxStepsReached).unwrap();
        assert_eq!(json, "\"max_steps_reached\"");
        assert_eq!(TerminationReason::ExecutionFatal.to_string(), "execution_fatal");
    }
}
