//! The three LLM roles of the adaptation loop.
//!
//! Each role is a small capability trait with one typed input struct per
//! call, so benchmark-specific variants are new implementations rather than
//! new parameters on the loop:
//!
//! 1. **Generator** -- writes the next reasoning + code step.
//! 2. **Reflector** -- diagnoses a finished trajectory.
//! 3. **Curator** -- turns a reflection into a playbook delta.
//!
//! [`llm`] provides implementations backed by an OpenAI-compatible chat API.

pub mod llm;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::env::EvaluationResult;
use crate::playbook::{BulletId, BulletTag, CuratorDelta, Playbook};
use crate::trajectory::SampleContext;

pub use llm::{extract_python_code, LlmCurator, LlmGenerator, LlmReflector};

// ---------------------------------------------------------------------------
// Generator
// ---------------------------------------------------------------------------

/// Everything the generator sees when writing step `step`.
#[derive(Debug, Clone, Copy)]
pub struct GeneratorInput<'a> {
    pub task_id: &'a str,
    pub task: &'a str,
    pub playbook: &'a Playbook,
    pub metadata: &'a SampleContext,
    /// The sample's prior context, if any.
    pub context: Option<&'a str>,
    /// Every previous step of this trajectory, rendered in order.
    pub trajectory_history: &'a str,
    /// Zero-based index of the step being generated.
    pub step: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeneratorOutput {
    pub reasoning: String,
    /// The code to execute, already stripped of markdown fences.
    pub code: String,
    /// Bullets the generator says it relied on.
    #[serde(default)]
    pub bullet_ids: Vec<BulletId>,
}

#[allow(async_fn_in_trait)]
pub trait Generator {
    /// An error means the model's output could not be used.
    async fn generate(&self, input: GeneratorInput<'_>) -> Result<GeneratorOutput>;
}

// ---------------------------------------------------------------------------
// Reflector
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct ReflectorInput<'a> {
    pub task_id: &'a str,
    pub task: &'a str,
    pub playbook: &'a Playbook,
    pub ground_truth: Option<&'a str>,
    /// The full step-by-step trajectory.
    pub feedback: &'a str,
    pub unit_test_results: &'a EvaluationResult,
}

/// A structured diagnosis of one trajectory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Reflection {
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub error_identification: String,
    #[serde(default, alias = "root_cause_analysis")]
    pub root_cause: String,
    #[serde(default)]
    pub correct_approach: String,
    #[serde(default)]
    pub key_insight: String,
    #[serde(default)]
    pub bullet_tags: Vec<BulletTag>,
}

impl Reflection {
    /// Compact rendering used in the curator's guidebook.
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        for (label, text) in [
            ("Error", &self.error_identification),
            ("Root cause", &self.root_cause),
            ("Correct approach", &self.correct_approach),
            ("Key insight", &self.key_insight),
        ] {
            if !text.trim().is_empty() {
                parts.push(format!("{label}: {}", text.trim()));
            }
        }
        if parts.is_empty() {
            "(empty reflection)".to_string()
        } else {
            parts.join("\n")
        }
    }
}

#[allow(async_fn_in_trait)]
pub trait Reflector {
    async fn reflect(&self, input: ReflectorInput<'_>) -> Result<Reflection>;
}

// ---------------------------------------------------------------------------
// Curator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct CuratorInput<'a> {
    pub task_id: &'a str,
    pub reflection: &'a Reflection,
    pub playbook: &'a Playbook,
    /// Code of the trajectory's last step that produced any.
    pub final_code: &'a str,
    /// The recent-reflection window, rendered oldest first.
    pub guidebook: &'a str,
    /// The task instruction the reflection is about.
    pub question_context: &'a str,
}

#[allow(async_fn_in_trait)]
pub trait Curator {
    async fn curate(&self, input: CuratorInput<'_>) -> Result<CuratorDelta>;
}
