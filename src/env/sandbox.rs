//! Code-execution sandbox environments.
//!
//! This module provides two implementations:
//! - [`SandboxEnv`] talks to a running sandbox server over HTTP.
//! - [`MockSandboxEnv`] replays scripted sessions for testing and dry runs.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing;

use super::traits::{Environment, EvaluationResult, Observation};
use crate::trajectory::Sample;

/// Markers the sandbox prints when user code raised.
const ERROR_MARKERS: &[&str] = &["Traceback (most recent call last)", "Execution failed"];

/// Classify raw sandbox output as success or a recoverable error.
pub fn classify_output(output: String) -> Observation {
    if ERROR_MARKERS.iter().any(|m| output.contains(m)) {
        Observation::Error(output)
    } else {
        Observation::Output(output)
    }
}

// ---------------------------------------------------------------------------
// HTTP-backed sandbox
// ---------------------------------------------------------------------------

/// A sandbox session served over HTTP.
///
/// The server is expected to expose:
/// - `POST {base_url}/initialize`     -- body: `{"task_id", "experiment_name"}`
/// - `POST {base_url}/execute`        -- body: `{"task_id", "code"}`
/// - `POST {base_url}/task_completed` -- body: `{"task_id"}`
/// - `POST {base_url}/evaluate`       -- body: `{"task_id", "suppress_errors", "report"}`
/// - `POST {base_url}/close_all`      -- body: `{"task_id"}`
///
/// Every endpoint answers with JSON containing an `output` field.
#[derive(Debug)]
pub struct SandboxEnv {
    base_url: String,
    experiment_name: String,
    http: reqwest::Client,
    task_id: Option<String>,
    usable: bool,
}

#[derive(Debug, Deserialize)]
struct ServerResponse<T> {
    output: T,
}

impl SandboxEnv {
    pub fn new(base_url: &str, experiment_name: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .expect("failed to build reqwest client for sandbox");

        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            experiment_name: experiment_name.to_string(),
            http,
            task_id: None,
            usable: false,
        }
    }

    fn session(&self) -> Result<&str> {
        match &self.task_id {
            Some(id) => Ok(id),
            None => bail!("no open sandbox session"),
        }
    }

    async fn post<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &str,
        body: serde_json::Value,
    ) -> Result<T> {
        let resp = self
            .http
            .post(format!("{}/{endpoint}", self.base_url))
            .json(&body)
            .send()
            .await
            .with_context(|| format!("failed to reach sandbox server on /{endpoint}"))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            bail!("sandbox /{endpoint} returned {status}: {text}");
        }

        let parsed: ServerResponse<T> = resp
            .json()
            .await
            .with_context(|| format!("failed to parse sandbox /{endpoint} response"))?;
        Ok(parsed.output)
    }
}

impl Environment for SandboxEnv {
    async fn initialize(&mut self, sample: &Sample) -> Result<()> {
        let body = serde_json::json!({
            "task_id": sample.task_id,
            "experiment_name": self.experiment_name,
        });
        self.post::<serde_json::Value>("initialize", body).await?;
        self.task_id = Some(sample.task_id.clone());
        self.usable = true;
        tracing::debug!(task_id = %sample.task_id, "Sandbox session initialized");
        Ok(())
    }

    async fn execute(&mut self, code: &str) -> Observation {
        let task_id = match self.session() {
            Ok(id) => id.to_string(),
            Err(e) => return Observation::Fatal(e.to_string()),
        };
        let body = serde_json::json!({ "task_id": task_id, "code": code });
        match self.post::<String>("execute", body).await {
            Ok(output) => classify_output(output),
            Err(e) => {
                tracing::warn!(task_id = %task_id, error = %e, "Sandbox execute failed");
                self.usable = false;
                Observation::Fatal(format!("{e:#}"))
            }
        }
    }

    async fn is_task_completed(&mut self) -> Result<bool> {
        let body = serde_json::json!({ "task_id": self.session()? });
        match self.post::<bool>("task_completed", body).await {
            Ok(done) => Ok(done),
            Err(e) => {
                self.usable = false;
                Err(e)
            }
        }
    }

    async fn evaluate(&mut self) -> Result<EvaluationResult> {
        let body = serde_json::json!({
            "task_id": self.session()?,
            "suppress_errors": true,
            "report": true,
        });
        let report: String = self.post("evaluate", body).await?;
        Ok(EvaluationResult::from_report(report))
    }

    fn is_usable(&self) -> bool {
        self.usable
    }

    async fn close(&mut self) -> Result<()> {
        let Some(task_id) = self.task_id.take() else {
            return Ok(());
        };
        self.usable = false;
        let body = serde_json::json!({ "task_id": task_id });
        self.post::<serde_json::Value>("close_all", body).await?;
        tracing::debug!(task_id = %task_id, "Sandbox session closed");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Mock sandbox for testing
// ---------------------------------------------------------------------------

/// Scripted behaviour for one task's session.
#[derive(Debug, Clone)]
pub struct MockScript {
    /// Observation for the n-th execute call; the last entry repeats.
    pub observations: Vec<Observation>,
    /// Report completion once this many blocks have run.
    pub complete_after: Option<usize>,
    /// Result of a successful evaluation.
    pub evaluation: EvaluationResult,
    /// Number of evaluate calls that fail before one succeeds.
    pub evaluation_failures: usize,
    /// Make `initialize` fail.
    pub fail_initialize: bool,
    /// Make `is_task_completed` fail once this many blocks have run.
    pub completion_error_after: Option<usize>,
}

impl Default for MockScript {
    fn default() -> Self {
        Self {
            observations: vec![Observation::Output("ok".into())],
            complete_after: None,
            evaluation: EvaluationResult {
                passed: 1,
                total: 1,
                report: "Num Passed Tests : 1\nNum Total Tests : 1".into(),
            },
            evaluation_failures: 0,
            fail_initialize: false,
            completion_error_after: None,
        }
    }
}

impl MockScript {
    pub fn completing_after(steps: usize) -> Self {
        Self {
            complete_after: Some(steps),
            ..Self::default()
        }
    }

    pub fn never_completing() -> Self {
        Self::default()
    }
}

/// A scripted sandbox that replays per-task sessions.
///
/// Code containing `complete_task(` marks the task complete, mirroring the
/// sandbox's supervisor API; scripts can also complete after a fixed number
/// of blocks.
#[derive(Debug, Clone, Default)]
pub struct MockSandboxEnv {
    scripts: HashMap<String, MockScript>,
    default_script: MockScript,
    current: Option<(String, MockScript)>,
    executed: usize,
    completed: bool,
    evaluate_calls: usize,
    usable: bool,
    /// Every code block executed, across sessions.
    pub executed_code: Vec<String>,
    /// Task ids of every session opened, in order.
    pub sessions: Vec<String>,
}

impl MockSandboxEnv {
    /// A mock whose sessions complete after two blocks and pass every test.
    pub fn new() -> Self {
        Self::with_default(MockScript::completing_after(2))
    }

    pub fn with_default(script: MockScript) -> Self {
        Self {
            default_script: script,
            ..Self::default()
        }
    }

    pub fn with_script(mut self, task_id: impl Into<String>, script: MockScript) -> Self {
        self.scripts.insert(task_id.into(), script);
        self
    }

    /// Total evaluate calls across sessions.
    pub fn evaluate_calls(&self) -> usize {
        self.evaluate_calls
    }

    fn script(&self) -> Result<&MockScript> {
        match &self.current {
            Some((_, script)) => Ok(script),
            None => bail!("no open mock session"),
        }
    }
}

impl Environment for MockSandboxEnv {
    async fn initialize(&mut self, sample: &Sample) -> Result<()> {
        let script = self
            .scripts
            .get(&sample.task_id)
            .cloned()
            .unwrap_or_else(|| self.default_script.clone());
        if script.fail_initialize {
            bail!("mock sandbox refused task {}", sample.task_id);
        }
        self.sessions.push(sample.task_id.clone());
        self.current = Some((sample.task_id.clone(), script));
        self.executed = 0;
        self.completed = false;
        self.usable = true;
        Ok(())
    }

    async fn execute(&mut self, code: &str) -> Observation {
        let observation = match self.script() {
            Ok(script) => script
                .observations
                .get(self.executed)
                .or_else(|| script.observations.last())
                .cloned()
                .unwrap_or_else(|| Observation::Output(String::new())),
            Err(e) => return Observation::Fatal(e.to_string()),
        };
        self.executed += 1;
        self.executed_code.push(code.to_string());
        if code.contains("complete_task(") {
            self.completed = true;
        }
        if observation.is_fatal() {
            self.usable = false;
        }
        observation
    }

    async fn is_task_completed(&mut self) -> Result<bool> {
        let (error_after, complete_after) = {
            let script = self.script()?;
            (script.completion_error_after, script.complete_after)
        };
        if error_after.is_some_and(|n| self.executed >= n) {
            self.usable = false;
            bail!("mock sandbox stopped responding");
        }
        let by_count = complete_after.is_some_and(|n| self.executed >= n);
        Ok(self.completed || by_count)
    }

    async fn evaluate(&mut self) -> Result<EvaluationResult> {
        self.evaluate_calls += 1;
        let Some((_, script)) = self.current.as_mut() else {
            bail!("no open mock session");
        };
        if script.evaluation_failures > 0 {
            script.evaluation_failures -= 1;
            bail!("mock evaluation failed");
        }
        Ok(script.evaluation.clone())
    }

    fn is_usable(&self) -> bool {
        self.usable
    }

    async fn close(&mut self) -> Result<()> {
        self.current = None;
        self.usable = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: &str) -> Sample {
        Sample::new(id, "Do the thing")
    }

    #[test]
    fn test_classify_output() {
        assert_eq!(
            classify_output("42".into()),
            Observation::Output("42".into())
        );
        let trace = "Traceback (most recent call last):\n  NameError: name 'x' is not defined";
        assert!(classify_output(trace.into()).is_error());
    }

    #[tokio::test]
    async fn test_mock_completes_on_complete_task_call() {
        let mut env = MockSandboxEnv::with_default(MockScript::never_completing());
        env.initialize(&sample("t1")).await.unwrap();

        env.execute("print(apis.spotify.show_account())").await;
        assert!(!env.is_task_completed().await.unwrap());
        env.execute("apis.supervisor.complete_task(answer=3)").await;
        assert!(env.is_task_completed().await.unwrap());
    }

    #[tokio::test]
    async fn test_mock_scripts_are_per_task() {
        let mut env = MockSandboxEnv::new().with_script(
            "broken",
            MockScript {
                fail_initialize: true,
                ..MockScript::default()
            },
        );
        assert!(env.initialize(&sample("broken")).await.is_err());
        env.initialize(&sample("fine")).await.unwrap();
        assert_eq!(env.sessions, vec!["fine".to_string()]);
    }

    #[tokio::test]
    async fn test_mock_evaluation_failures_then_success() {
        let mut env = MockSandboxEnv::with_default(MockScript {
            evaluation_failures: 1,
            ..MockScript::default()
        });
        env.initialize(&sample("t")).await.unwrap();
        assert!(env.evaluate().await.is_err());
        assert_eq!(env.evaluate().await.unwrap().passed, 1);
        assert_eq!(env.evaluate_calls(), 2);
    }
}
