//! Sandbox environment abstractions and concrete implementations.
//!
//! Every environment implements the [`Environment`] trait so that the
//! adaptation pipeline can drive sessions uniformly.
//!
//! - **Sandbox** ([`sandbox`]) -- an HTTP client for a code-execution server,
//!   plus [`MockSandboxEnv`], which replays scripted sessions so the full
//!   pipeline can be exercised without external dependencies.

pub mod sandbox;
pub mod traits;

pub use sandbox::{MockSandboxEnv, MockScript, SandboxEnv};
pub use traits::{parse_unit_test_report, Environment, EvaluationResult, Observation};

use crate::trajectory::Sample;

// ---------------------------------------------------------------------------
// AnyEnv: enum dispatch wrapper for runtime environment selection
// ---------------------------------------------------------------------------

/// An enum wrapper around the concrete environments, enabling runtime
/// selection without `dyn` (which is incompatible with async trait methods).
pub enum AnyEnv {
    Sandbox(SandboxEnv),
    Mock(MockSandboxEnv),
}

impl Environment for AnyEnv {
    async fn initialize(&mut self, sample: &Sample) -> anyhow::Result<()> {
        match self {
            Self::Sandbox(e) => e.initialize(sample).await,
            Self::Mock(e) => e.initialize(sample).await,
        }
    }

    async fn execute(&mut self, code: &str) -> Observation {
        match self {
            Self::Sandbox(e) => e.execute(code).await,
            Self::Mock(e) => e.execute(code).await,
        }
    }

    async fn is_task_completed(&mut self) -> anyhow::Result<bool> {
        match self {
            Self::Sandbox(e) => e.is_task_completed().await,
            Self::Mock(e) => e.is_task_completed().await,
        }
    }

    async fn evaluate(&mut self) -> anyhow::Result<EvaluationResult> {
        match self {
            Self::Sandbox(e) => e.evaluate().await,
            Self::Mock(e) => e.evaluate().await,
        }
    }

    fn is_usable(&self) -> bool {
        match self {
            Self::Sandbox(e) => e.is_usable(),
            Self::Mock(e) => e.is_usable(),
        }
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        match self {
            Self::Sandbox(e) => e.close().await,
            Self::Mock(e) => e.close().await,
        }
    }
}
