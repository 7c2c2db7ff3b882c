//! Core environment trait and shared types.
//!
//! An environment is a sandbox session in which the generator's code runs.
//! Execution failures are data: [`Environment::execute`] never returns an
//! error, it returns an [`Observation`] describing what happened.

use std::fmt;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::trajectory::Sample;

/// What the sandbox reported for one executed code block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "text", rename_all = "snake_case")]
pub enum Observation {
    /// The code ran; stdout and the printed result.
    Output(String),
    /// The code raised; the agent can recover on its next step.
    Error(String),
    /// The session can no longer be used.
    Fatal(String),
}

impl Observation {
    pub fn text(&self) -> &str {
        match self {
            Self::Output(t) | Self::Error(t) | Self::Fatal(t) => t,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Output(_) => "output",
            Self::Error(_) => "error",
            Self::Fatal(_) => "fatal",
        }
    }
}

impl fmt::Display for Observation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.label(), self.text())
    }
}

/// Unit-test results for one finished session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub passed: usize,
    pub total: usize,
    /// The evaluator's human-readable report.
    pub report: String,
}

impl EvaluationResult {
    /// Result recorded when the session could not be evaluated.
    ///
    /// With no known test count this is `0/0`, which scores a TGC of 0.
    pub fn all_failing(reason: impl Into<String>) -> Self {
        Self {
            passed: 0,
            total: 0,
            report: reason.into(),
        }
    }

    /// Build a result from a report containing `Num Passed Tests : X` and
    /// `Num Total Tests : Y` lines. Missing counts read as 0.
    pub fn from_report(report: impl Into<String>) -> Self {
        let report = report.into();
        let (passed, total) = parse_unit_test_report(&report);
        Self {
            passed,
            total,
            report,
        }
    }

    /// Task goal completion: `passed / total`, or 0.0 when there are no tests.
    pub fn tgc(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.passed as f64 / self.total as f64
        }
    }
}

/// Extract `(passed, total)` from an evaluator report.
pub fn parse_unit_test_report(report: &str) -> (usize, usize) {
    let mut passed = 0;
    let mut total = 0;
    for line in report.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
        let Ok(count) = value.trim().parse::<usize>() else {
            continue;
        };
        match key.as_str() {
            "num passed tests" => passed = count,
            "num total tests" => total = count,
            _ => {}
        }
    }
    (passed, total)
}

/// A sandbox that runs one sample's code, one block at a time.
///
/// A session is opened with [`initialize`](Environment::initialize) and
/// holds mutable state; callers must not execute concurrently on the same
/// instance.
#[allow(async_fn_in_trait)]
pub trait Environment {
    /// Open an isolated session for `sample`.
    async fn initialize(&mut self, sample: &Sample) -> Result<()>;

    /// Run a code block and report what happened.
    async fn execute(&mut self, code: &str) -> Observation;

    /// Whether the agent has marked the task complete.
    ///
    /// An error means the session stopped responding.
    async fn is_task_completed(&mut self) -> Result<bool>;

    /// Run the task's unit tests against the session state.
    async fn evaluate(&mut self) -> Result<EvaluationResult>;

    /// `false` once the session has hit an unrecoverable fault.
    fn is_usable(&self) -> bool;

    /// Release the session.
    async fn close(&mut self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_report_counts() {
        let report = "Success: False\n\n    Num Passed Tests : 1\n    Num Failed Tests : 1\n    Num Total  Tests : 2\n";
        assert_eq!(parse_unit_test_report(report), (1, 2));
        assert_eq!(parse_unit_test_report("Evaluation failed after 3 attempts."), (0, 0));
    }

    #[test]
    fn test_tgc() {
        let result = EvaluationResult {
            passed: 3,
            total: 4,
            report: String::new(),
        };
        assert!((result.tgc() - 0.75).abs() < 1e-12);
        assert_eq!(EvaluationResult::all_failing("no session").tgc(), 0.0);
    }

    #[test]
    fn test_observation_serde_shape() {
        let json = serde_json::to_string(&Observation::Error("NameError".into())).unwrap();
        assert_eq!(json, r#"{"kind":"error","text":"NameError"}"#);
    }
}
