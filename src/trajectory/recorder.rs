//! Step accumulation and termination for one sample.
//!
//! The [`TrajectoryRecorder`] is a small state machine:
//!
//! ```text
//! Pending -> Generating -> Executing -> Observing -> Generating | Terminal
//! ```
//!
//! After each observation the recorder decides whether to continue:
//!   1. a fatal observation (or too many consecutive errors) ends the run
//!      with [`TerminationReason::ExecutionFatal`],
//!   2. otherwise the environment's completion predicate is consulted,
//!   3. otherwise the step cap ends the run with
//!      [`TerminationReason::MaxStepsReached`].
//!
//! Recoverable execution errors are recorded as ordinary steps; the next
//! generator call sees them in the history.

use anyhow::{bail, Result};
use uuid::Uuid;

use super::types::{Step, TerminationReason, Trajectory};
use crate::env::{Environment, Observation};

/// Where the recorder is in the generate/execute/observe cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    Pending,
    Generating,
    Executing,
    Observing,
    Terminal(TerminationReason),
}

#[derive(Debug, Clone)]
pub struct TrajectoryRecorder {
    task_id: String,
    max_steps: usize,
    max_consecutive_errors: usize,
    steps: Vec<Step>,
    state: RecorderState,
    consecutive_errors: usize,
}

impl TrajectoryRecorder {
    /// `max_consecutive_errors == 0` disables the consecutive-error check.
    pub fn new(task_id: impl Into<String>, max_steps: usize, max_consecutive_errors: usize) -> Self {
        Self {
            task_id: task_id.into(),
            max_steps,
            max_consecutive_errors,
            steps: Vec::new(),
            state: RecorderState::Pending,
            consecutive_errors: 0,
        }
    }

    /// Reset to an empty trajectory in `Pending`.
    ///
    /// A cap of zero terminates immediately with no steps.
    pub fn start(&mut self) {
        self.steps.clear();
        self.consecutive_errors = 0;
        self.state = if self.max_steps == 0 {
            RecorderState::Terminal(TerminationReason::MaxStepsReached)
        } else {
            RecorderState::Pending
        };
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, RecorderState::Terminal(_))
    }

    pub fn termination(&self) -> Option<TerminationReason> {
        match self.state {
            RecorderState::Terminal(reason) => Some(reason),
            _ => None,
        }
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Index of the step about to be generated.
    pub fn next_index(&self) -> usize {
        self.steps.len()
    }

    /// Enter `Generating`.
    pub fn begin_generation(&mut self) -> Result<()> {
        match self.state {
            RecorderState::Pending | RecorderState::Generating => {
                self.state = RecorderState::Generating;
                Ok(())
            }
            other => bail!("cannot generate a step in state {other:?}"),
        }
    }

    /// Enter `Executing`.
    pub fn begin_execution(&mut self) -> Result<()> {
        match self.state {
            RecorderState::Generating => {
                self.state = RecorderState::Executing;
                Ok(())
            }
            other => bail!("cannot execute a step in state {other:?}"),
        }
    }

    /// Append a step and enter `Observing`, or `Terminal` if the observation
    /// ends the session.
    pub fn record_step(
        &mut self,
        reasoning: impl Into<String>,
        code: impl Into<String>,
        observation: Observation,
    ) -> RecorderState {
        if observation.is_error() {
            self.consecutive_errors += 1;
        } else {
            self.consecutive_errors = 0;
        }
        let fatal = observation.is_fatal()
            || (self.max_consecutive_errors > 0
                && self.consecutive_errors >= self.max_consecutive_errors);

        self.steps.push(Step {
            index: self.steps.len(),
            reasoning: reasoning.into(),
            code: code.into(),
            observation,
        });

        self.state = if fatal {
            tracing::debug!(
                task_id = %self.task_id,
                step = self.steps.len(),
                consecutive_errors = self.consecutive_errors,
                "Session fatal"
            );
            RecorderState::Terminal(TerminationReason::ExecutionFatal)
        } else {
            RecorderState::Observing
        };
        self.state
    }

    /// Record a generator failure as a fatal step and terminate.
    pub fn record_generation_failure(&mut self, message: impl Into<String>) -> RecorderState {
        let message = message.into();
        self.record_step(
            String::new(),
            String::new(),
            Observation::Fatal(format!("generator failed: {message}")),
        )
    }

    /// Resolve an `Observing` state from the environment's completion flag.
    pub fn observe_completion(&mut self, completed: bool) -> RecorderState {
        if self.state != RecorderState::Observing {
            return self.state;
        }
        self.state = if completed {
            RecorderState::Terminal(TerminationReason::Completed)
        } else if self.steps.len() >= self.max_steps {
            RecorderState::Terminal(TerminationReason::MaxStepsReached)
        } else {
            RecorderState::Generating
        };
        self.state
    }

    /// Query the environment's completion predicate and resolve the state.
    ///
    /// A failing query means the session stopped responding and terminates
    /// with `ExecutionFatal`.
    pub async fn check_completion<E: Environment>(&mut self, env: &mut E) -> RecorderState {
        if self.state != RecorderState::Observing {
            return self.state;
        }
        match env.is_task_completed().await {
            Ok(completed) => self.observe_completion(completed),
            Err(e) => {
                tracing::warn!(task_id = %self.task_id, error = %e, "Completion check failed");
                self.state = RecorderState::Terminal(TerminationReason::ExecutionFatal);
                self.state
            }
        }
    }

    // ------------------------------------------------------------------
    // Serialisation
    // ------------------------------------------------------------------

    /// The history handed to the generator: every step so far, in order.
    pub fn format_for_generator(&self) -> String {
        if self.steps.is_empty() {
            return "(no steps yet)".to_string();
        }
        self.steps
            .iter()
            .map(format_step)
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// The complete audit trail handed to the reflector.
    pub fn to_feedback(&self) -> String {
        let termination = self
            .termination()
            .map(|t| t.as_str())
            .unwrap_or("in_progress");
        let mut out = format!(
            "Task: {}\nTermination: {}\nSteps: {}\n",
            self.task_id,
            termination,
            self.steps.len()
        );
        for step in &self.steps {
            out.push('\n');
            out.push_str(&format_step(step));
            out.push('\n');
        }
        out
    }

    /// Consume the recorder into a finished trajectory.
    pub fn finish(self) -> Result<Trajectory> {
        let Some(termination) = self.termination() else {
            bail!(
                "trajectory for {} finished in non-terminal state {:?}",
                self.task_id,
                self.state
            );
        };
        Ok(Trajectory {
            id: Uuid::new_v4().to_string(),
            task_id: self.task_id,
            steps: self.steps,
            termination,
        })
    }
}

fn format_step(step: &Step) -> String {
    format!(
        "### Step {}\nReasoning:\n{}\nCode:\n```python\n{}\n```\nObservation ({}):\n{}",
        step.index + 1,
        step.reasoning.trim(),
        step.code.trim(),
        step.observation.label(),
        step.observation.text().trim()
    )
}
