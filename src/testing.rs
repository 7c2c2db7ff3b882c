//! Deterministic role and deduplicator doubles for unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};

use crate::playbook::{
    Bullet, CuratorDelta, DedupPlan, Deduplicator, DeltaOperation, LexicalDeduplicator,
};
use crate::roles::{
    Curator, CuratorInput, Generator, GeneratorInput, GeneratorOutput, Reflection, Reflector,
    ReflectorInput,
};

/// What a [`ScriptedGenerator`] was asked.
#[derive(Debug, Clone)]
pub struct GeneratorCall {
    pub task: String,
    pub step: usize,
    pub history: String,
    pub playbook_size: usize,
}

/// Emits `print(<step>)` for every step and records its inputs.
#[derive(Debug, Clone, Default)]
pub struct ScriptedGenerator {
    fail_at: Option<usize>,
    calls: Arc<Mutex<Vec<GeneratorCall>>>,
}

impl ScriptedGenerator {
    /// Fail when asked for step `step` (zero-based).
    pub fn failing_at(step: usize) -> Self {
        Self {
            fail_at: Some(step),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<GeneratorCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl Generator for ScriptedGenerator {
    async fn generate(&self, input: GeneratorInput<'_>) -> Result<GeneratorOutput> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(GeneratorCall {
                task: input.task.to_string(),
                step: input.step,
                history: input.trajectory_history.to_string(),
                playbook_size: input.playbook.len(),
            });
        }
        if self.fail_at == Some(input.step) {
            bail!("reply had no final answer");
        }
        Ok(GeneratorOutput {
            reasoning: format!("step {} of {}", input.step, input.task),
            code: format!("```python\nprint({})\n```", input.step),
            bullet_ids: input.playbook.ids(),
        })
    }
}

/// Returns a fixed-shape reflection whose insight is either constant or
/// derived from the task.
#[derive(Debug, Clone, Default)]
pub struct FixedReflector {
    insight: Option<String>,
    fail_all: bool,
    fail_task: Option<String>,
}

impl FixedReflector {
    pub fn per_task() -> Self {
        Self::default()
    }

    pub fn constant(insight: impl Into<String>) -> Self {
        Self {
            insight: Some(insight.into()),
            ..Self::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail_all: true,
            ..Self::default()
        }
    }

    /// Fail only for `task_id`.
    pub fn failing_on(task_id: impl Into<String>) -> Self {
        Self {
            fail_task: Some(task_id.into()),
            ..Self::default()
        }
    }
}

impl Reflector for FixedReflector {
    async fn reflect(&self, input: ReflectorInput<'_>) -> Result<Reflection> {
        if self.fail_all || self.fail_task.as_deref() == Some(input.task_id) {
            bail!("reflection had no key insight");
        }
        let key_insight = self
            .insight
            .clone()
            .unwrap_or_else(|| format!("Verify the answer before finishing: {}", input.task));
        Ok(Reflection {
            reasoning: format!(
                "{} of {} tests passed",
                input.unit_test_results.passed, input.unit_test_results.total
            ),
            key_insight,
            ..Reflection::default()
        })
    }
}

/// Adds the reflection's key insight as a new `strategies` bullet.
#[derive(Debug, Clone, Default)]
pub struct EchoCurator;

impl Curator for EchoCurator {
    async fn curate(&self, input: CuratorInput<'_>) -> Result<CuratorDelta> {
        Ok(CuratorDelta {
            reasoning: "record the insight".into(),
            operations: vec![DeltaOperation::Add {
                section: "strategies".into(),
                content: input.reflection.key_insight.clone(),
            }],
        })
    }
}

/// Returns the same delta every time.
#[derive(Debug, Clone)]
pub struct FixedCurator(pub CuratorDelta);

impl Curator for FixedCurator {
    async fn curate(&self, _input: CuratorInput<'_>) -> Result<CuratorDelta> {
        Ok(self.0.clone())
    }
}

/// Lexical deduplication that counts its invocations.
#[derive(Debug, Clone, Default)]
pub struct CountingDeduplicator {
    calls: Arc<AtomicUsize>,
    candidate_counts: Arc<Mutex<Vec<usize>>>,
    fail: bool,
}

impl CountingDeduplicator {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Candidate count seen by each call.
    pub fn candidate_counts(&self) -> Vec<usize> {
        self.candidate_counts
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }
}

impl Deduplicator for CountingDeduplicator {
    async fn deduplicate(&self, candidates: &[Bullet]) -> Result<DedupPlan> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut counts) = self.candidate_counts.lock() {
            counts.push(candidates.len());
        }
        if self.fail {
            bail!("embedding service unavailable");
        }
        LexicalDeduplicator.deduplicate(candidates).await
    }
}
