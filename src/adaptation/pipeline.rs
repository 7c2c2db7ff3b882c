//! The per-sample adaptation step shared by the offline and online drivers.
//!
//! [`AdapterPipeline::process`] runs one sample end to end:
//!
//! 1. open an environment session,
//! 2. generate/execute/observe until the recorder terminates,
//! 3. evaluate the session (retried on failure, never after success),
//! 4. reflect on the trajectory and curate a delta,
//! 5. apply the reflector's tags and the delta to the playbook in one write,
//!    then push the reflection into the window,
//! 6. close the session.
//!
//! Execution errors inside step 2 are trajectory data. A session that cannot
//! be opened is recorded as a zero-step `ExecutionFatal` trajectory with every
//! test failing, and nothing is learned from it. Failures in steps 4 and 5 are
//! returned as [`AdapterError`]; the playbook is untouched when that happens.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Instant;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::metrics::{tgc, Phase, TaskMetrics};
use crate::config::AdaptationConfig;
use crate::env::{Environment, EvaluationResult};
use crate::error::AdapterError;
use crate::playbook::{BulletId, Provenance, ReflectionWindow, SharedPlaybook};
use crate::roles::{
    extract_python_code, Curator, CuratorInput, Generator, GeneratorInput, Reflection, Reflector,
    ReflectorInput,
};
use crate::trajectory::{Sample, TerminationReason, Trajectory, TrajectoryRecorder};

/// Where a sample sits in the run, for metrics and provenance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleSlot {
    pub phase: Phase,
    /// One-based epoch, offline only.
    pub epoch: Option<usize>,
    pub sample_index: usize,
}

impl SampleSlot {
    pub fn offline(epoch: usize, sample_index: usize) -> Self {
        Self {
            phase: Phase::Offline,
            epoch: Some(epoch),
            sample_index,
        }
    }

    pub fn online(sample_index: usize) -> Self {
        Self {
            phase: Phase::Online,
            epoch: None,
            sample_index,
        }
    }

    pub fn evaluation(sample_index: usize) -> Self {
        Self {
            phase: Phase::Evaluation,
            epoch: None,
            sample_index,
        }
    }
}

/// Everything one call to [`AdapterPipeline::process`] produced.
#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    pub trajectory: Trajectory,
    /// Bullets added or updated by this sample's delta.
    pub touched_ids: BTreeSet<BulletId>,
    pub evaluation: EvaluationResult,
    pub metrics: TaskMetrics,
}

/// Generator, reflector and curator wired to a shared playbook.
pub struct AdapterPipeline<G, R, C> {
    generator: G,
    reflector: R,
    curator: C,
    playbook: SharedPlaybook,
    window: Mutex<ReflectionWindow>,
    config: AdaptationConfig,
    trajectory_dir: Option<PathBuf>,
}

impl<G: Generator, R: Reflector, C: Curator> AdapterPipeline<G, R, C> {
    pub fn new(
        generator: G,
        reflector: R,
        curator: C,
        playbook: SharedPlaybook,
        config: AdaptationConfig,
    ) -> Self {
        let window = Mutex::new(ReflectionWindow::new(config.window_size));
        Self {
            generator,
            reflector,
            curator,
            playbook,
            window,
            config,
            trajectory_dir: None,
        }
    }

    /// Write each sample's feedback to `<output_dir>/trajectories/<task_id>.txt`.
    pub fn with_trajectory_log(mut self, output_dir: impl AsRef<Path>) -> Self {
        self.trajectory_dir = Some(output_dir.as_ref().join("trajectories"));
        self
    }

    pub fn playbook(&self) -> &SharedPlaybook {
        &self.playbook
    }

    pub fn config(&self) -> &AdaptationConfig {
        &self.config
    }

    /// Reflections currently in the window, oldest first.
    pub async fn recent_reflections(&self) -> Vec<Reflection> {
        self.window.lock().await.iter().cloned().collect()
    }

    // ------------------------------------------------------------------
    // Public operations
    // ------------------------------------------------------------------

    /// Run one sample through the full adaptation step.
    pub async fn process<E: Environment>(
        &self,
        sample: &Sample,
        env: &mut E,
        slot: SampleSlot,
    ) -> Result<ProcessOutcome, AdapterError> {
        let started = Instant::now();
        if let Err(e) = env.initialize(sample).await {
            return Ok(self.unopened_session(sample, env, slot, started, e).await);
        }

        let result = self.adapt(sample, env, slot, started).await;
        close_session(env, &sample.task_id).await;
        result
    }

    /// Run and evaluate one sample against the frozen playbook.
    pub async fn evaluate_only<E: Environment>(
        &self,
        sample: &Sample,
        env: &mut E,
        slot: SampleSlot,
    ) -> Result<ProcessOutcome, AdapterError> {
        let started = Instant::now();
        if let Err(e) = env.initialize(sample).await {
            return Ok(self.unopened_session(sample, env, slot, started, e).await);
        }

        let result = async {
            let (trajectory, _) = self.run_trajectory(sample, env).await?;
            let evaluation = self.evaluate_session(env, &trajectory).await;
            let metrics = self
                .task_metrics(&trajectory, &evaluation, slot, started)
                .await;
            Ok::<_, AdapterError>(ProcessOutcome {
                trajectory,
                touched_ids: BTreeSet::new(),
                evaluation,
                metrics,
            })
        }
        .await;
        close_session(env, &sample.task_id).await;
        result
    }

    // ------------------------------------------------------------------
    // Stages
    // ------------------------------------------------------------------

    async fn adapt<E: Environment>(
        &self,
        sample: &Sample,
        env: &mut E,
        slot: SampleSlot,
        started: Instant,
    ) -> Result<ProcessOutcome, AdapterError> {
        let task_id = &sample.task_id;
        let (trajectory, feedback) = self.run_trajectory(sample, env).await?;
        let evaluation = self.evaluate_session(env, &trajectory).await;

        let playbook = self.playbook.snapshot().await;
        let reflection = self
            .reflector
            .reflect(ReflectorInput {
                task_id: task_id.as_str(),
                task: &sample.instruction,
                playbook: &playbook,
                ground_truth: sample.ground_truth.as_deref(),
                feedback: &feedback,
                unit_test_results: &evaluation,
            })
            .await
            .map_err(|source| AdapterError::Reflect {
                task_id: task_id.clone(),
                source,
            })?;

        let guidebook = self.window.lock().await.as_guidebook();
        let delta = self
            .curator
            .curate(CuratorInput {
                task_id: task_id.as_str(),
                reflection: &reflection,
                playbook: &playbook,
                final_code: trajectory.final_code(),
                guidebook: &guidebook,
                question_context: &sample.instruction,
            })
            .await
            .map_err(|source| AdapterError::Curate {
                task_id: task_id.clone(),
                source,
            })?;

        // The window lock is held across the playbook write so the delta and
        // its reflection land together.
        let provenance = Provenance::new(task_id.as_str(), slot.epoch);
        let touched_ids: BTreeSet<BulletId> = {
            let mut window = self.window.lock().await;
            let touched = self
                .playbook
                .apply_delta(&delta, &reflection.bullet_tags, &provenance)
                .await
                .map_err(|source| AdapterError::Playbook {
                    task_id: task_id.clone(),
                    source,
                })?;
            window.push(reflection);
            touched.into_iter().collect()
        };

        let metrics = self
            .task_metrics(&trajectory, &evaluation, slot, started)
            .await;
        info!(
            task_id = %task_id,
            termination = %trajectory.termination,
            steps = trajectory.len(),
            passed = evaluation.passed,
            total = evaluation.total,
            operations = delta.operations.len(),
            touched = touched_ids.len(),
            bullets = metrics.playbook_size,
            "Adapted on sample"
        );

        Ok(ProcessOutcome {
            trajectory,
            touched_ids,
            evaluation,
            metrics,
        })
    }

    /// Drive the generate/execute/observe loop to termination.
    ///
    /// Returns the finished trajectory and its feedback text.
    async fn run_trajectory<E: Environment>(
        &self,
        sample: &Sample,
        env: &mut E,
    ) -> Result<(Trajectory, String), AdapterError> {
        let task_id = &sample.task_id;
        let recorder_error = |source| AdapterError::Recorder {
            task_id: task_id.clone(),
            source,
        };

        let mut recorder = TrajectoryRecorder::new(
            task_id.as_str(),
            self.config.max_steps,
            self.config.max_consecutive_errors,
        );
        recorder.start();

        while !recorder.is_terminal() {
            recorder.begin_generation().map_err(recorder_error)?;
            let playbook = self.playbook.snapshot().await;
            let history = recorder.format_for_generator();
            let step = recorder.next_index();

            let output = match self
                .generator
                .generate(GeneratorInput {
                    task_id: task_id.as_str(),
                    task: &sample.instruction,
                    playbook: &playbook,
                    metadata: &sample.metadata,
                    context: sample.context.as_deref(),
                    trajectory_history: &history,
                    step,
                })
                .await
            {
                Ok(output) => output,
                Err(e) => {
                    warn!(task_id = %task_id, step, error = %e, "Generator failed");
                    recorder.record_generation_failure(format!("{e:#}"));
                    break;
                }
            };

            recorder.begin_execution().map_err(recorder_error)?;
            let code = extract_python_code(&output.code);
            let observation = env.execute(&code).await;
            debug!(
                task_id = %task_id,
                step,
                observation = observation.label(),
                cited = output.bullet_ids.len(),
                "Executed step"
            );
            recorder.record_step(output.reasoning, code, observation);
            recorder.check_completion(env).await;
        }

        let feedback = recorder.to_feedback();
        let trajectory = recorder.finish().map_err(recorder_error)?;
        self.write_trajectory_log(task_id, &feedback);
        Ok((trajectory, feedback))
    }

    /// Evaluate the session, retrying failed calls.
    ///
    /// A session left unusable by a fatal step, or one that never answers,
    /// is recorded as all-failing.
    async fn evaluate_session<E: Environment>(
        &self,
        env: &mut E,
        trajectory: &Trajectory,
    ) -> EvaluationResult {
        let task_id = &trajectory.task_id;
        if trajectory.termination == TerminationReason::ExecutionFatal && !env.is_usable() {
            warn!(task_id = %task_id, "Session unusable, recording all tests as failing");
            return EvaluationResult::all_failing("session unusable after a fatal execution error");
        }

        let attempts = self.config.evaluation_attempts.max(1);
        for attempt in 1..=attempts {
            match env.evaluate().await {
                Ok(result) => return result,
                Err(e) => {
                    warn!(task_id = %task_id, attempt, attempts, error = %e, "Evaluation failed")
                }
            }
        }
        EvaluationResult::all_failing(format!("evaluation failed after {attempts} attempts"))
    }

    /// The outcome of a sample whose session never opened.
    async fn unopened_session<E: Environment>(
        &self,
        sample: &Sample,
        env: &mut E,
        slot: SampleSlot,
        started: Instant,
        error: anyhow::Error,
    ) -> ProcessOutcome {
        let task_id = &sample.task_id;
        warn!(
            task_id = %task_id,
            error = %format!("{error:#}"),
            "Session could not be opened, recording every test as failing"
        );
        close_session(env, task_id).await;

        let trajectory = Trajectory::unstarted(task_id.as_str());
        let evaluation =
            EvaluationResult::all_failing(format!("session could not be opened: {error:#}"));
        let metrics = self
            .task_metrics(&trajectory, &evaluation, slot, started)
            .await;
        ProcessOutcome {
            trajectory,
            touched_ids: BTreeSet::new(),
            evaluation,
            metrics,
        }
    }

    async fn task_metrics(
        &self,
        trajectory: &Trajectory,
        evaluation: &EvaluationResult,
        slot: SampleSlot,
        started: Instant,
    ) -> TaskMetrics {
        TaskMetrics {
            task_id: trajectory.task_id.clone(),
            phase: slot.phase,
            epoch: slot.epoch,
            sample_index: slot.sample_index,
            termination: trajectory.termination,
            num_steps: trajectory.len(),
            passed_count: evaluation.passed,
            total_count: evaluation.total,
            tgc: tgc(evaluation.passed, evaluation.total),
            elapsed_secs: started.elapsed().as_secs_f64(),
            playbook_size: self.playbook.len().await,
        }
    }

    fn write_trajectory_log(&self, task_id: &str, feedback: &str) {
        let Some(dir) = &self.trajectory_dir else {
            return;
        };
        let file_name: String = task_id
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        let path = dir.join(format!("{file_name}.txt"));
        let written = std::fs::create_dir_all(dir).and_then(|_| std::fs::write(&path, feedback));
        if let Err(e) = written {
            warn!(task_id = %task_id, path = %path.display(), error = %e, "Failed to write trajectory log");
        }
    }
}

async fn close_session<E: Environment>(env: &mut E, task_id: &str) {
    if let Err(e) = env.close().await {
        warn!(task_id = %task_id, error = %e, "Failed to close environment session");
    }
}
