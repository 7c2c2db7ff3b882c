//! Multi-epoch adaptation over a fixed, ordered sample collection.
//!
//! ```text
//! for epoch in 1..=E:
//!     touched = {}
//!     for sample in samples (stable order):
//!         touched |= pipeline.process(sample)
//!         every N samples (optional): dedup(ids since last pass)
//!     dedup(touched)          -- only bullets touched this epoch
//!     save playbook
//! ```
//!
//! A failed deduplication pass is logged and counted; the epoch's playbook
//! is left as it was and the run continues.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{ensure, Context, Result};
use tracing::{debug, error, info};

use super::metrics::{save_before_abort, save_summary, RunLog, RunReport};
use super::pipeline::{AdapterPipeline, SampleSlot};
use crate::config::OfflineConfig;
use crate::env::Environment;
use crate::playbook::{AnyDeduplicator, BulletId, Deduplicator};
use crate::roles::{Curator, Generator, Reflector};
use crate::trajectory::Sample;

pub struct OfflineAdapter<G, R, C, D = AnyDeduplicator> {
    pipeline: AdapterPipeline<G, R, C>,
    deduplicator: Option<D>,
    config: OfflineConfig,
    output_dir: Option<PathBuf>,
}

impl<G: Generator, R: Reflector, C: Curator> OfflineAdapter<G, R, C> {
    /// An adapter with no deduplicator.
    pub fn new(pipeline: AdapterPipeline<G, R, C>, config: OfflineConfig) -> Self {
        Self {
            pipeline,
            deduplicator: None,
            config,
            output_dir: None,
        }
    }
}

impl<G, R, C, D> OfflineAdapter<G, R, C, D>
where
    G: Generator,
    R: Reflector,
    C: Curator,
    D: Deduplicator,
{
    pub fn with_deduplicator<D2: Deduplicator>(
        self,
        deduplicator: D2,
    ) -> OfflineAdapter<G, R, C, D2> {
        OfflineAdapter {
            pipeline: self.pipeline,
            deduplicator: Some(deduplicator),
            config: self.config,
            output_dir: self.output_dir,
        }
    }

    /// Save playbooks, metrics and the run summary under `dir`.
    pub fn with_output_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.output_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn pipeline(&self) -> &AdapterPipeline<G, R, C> {
        &self.pipeline
    }

    /// Adapt over `samples` for the configured number of epochs.
    ///
    /// A sample whose session cannot be opened is recorded as failed and the
    /// run moves on. A structural failure on any sample aborts the run; the
    /// playbook keeps every write committed before it and is saved first.
    pub async fn run<E: Environment>(&self, samples: &[Sample], env: &mut E) -> Result<RunReport> {
        let epochs = self.config.epochs;
        ensure!(epochs >= 1, "offline adaptation needs at least one epoch");

        let playbook = self.pipeline.playbook();
        let mut log = RunLog::open(self.output_dir.as_deref())?;
        let mut dedup_failures = 0;

        info!(
            samples = samples.len(),
            epochs,
            dedup = self.deduplicator.is_some(),
            "Starting offline adaptation"
        );

        for epoch in 1..=epochs {
            let mut epoch_bullets: BTreeSet<BulletId> = BTreeSet::new();
            let mut since_last_pass: BTreeSet<BulletId> = BTreeSet::new();

            for (index, sample) in samples.iter().enumerate() {
                let outcome = match self
                    .pipeline
                    .process(sample, env, SampleSlot::offline(epoch, index))
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        save_before_abort(playbook, self.output_dir.as_deref()).await;
                        return Err(anyhow::Error::new(e).context(format!(
                            "epoch {epoch}, sample {index} ({}) failed",
                            sample.task_id
                        )));
                    }
                };

                epoch_bullets.extend(&outcome.touched_ids);
                since_last_pass.extend(&outcome.touched_ids);
                log.record(outcome.metrics);

                let every = self.config.dedup_every;
                if every > 0 && (index + 1) % every == 0 && index + 1 < samples.len() {
                    if !self.dedup_pass(&since_last_pass, epoch).await {
                        dedup_failures += 1;
                    }
                    since_last_pass.clear();
                }
            }

            if !self.dedup_pass(&epoch_bullets, epoch).await {
                dedup_failures += 1;
            }

            info!(
                epoch,
                touched = epoch_bullets.len(),
                bullets = playbook.len().await,
                total_steps = log.total_steps(),
                "Epoch complete"
            );

            if let Some(dir) = &self.output_dir {
                playbook
                    .save_to_file(dir.join(format!("playbook_epoch_{epoch}.json")))
                    .await?;
                playbook.save_to_file(dir.join("playbook.json")).await?;
            }
        }

        let report = log.finish(
            self.pipeline.config().sgc_threshold,
            dedup_failures,
            playbook.len().await,
        );
        if let Some(dir) = &self.output_dir {
            save_summary(dir, "offline_summary.json", &report.summary)?;
        }
        info!(
            tasks = report.summary.tasks,
            mean_tgc = report.summary.mean_tgc,
            sgc = report.summary.sgc,
            dedup_failures,
            "Offline adaptation complete"
        );
        Ok(report)
    }

    /// Evaluate the current playbook on held-out samples without learning.
    pub async fn evaluate<E: Environment>(
        &self,
        samples: &[Sample],
        env: &mut E,
    ) -> Result<RunReport> {
        evaluate_frozen(&self.pipeline, samples, env, self.output_dir.as_deref()).await
    }

    /// Run the deduplicator over `ids`, logging a failed pass.
    ///
    /// Returns `false` when the pass failed.
    async fn dedup_pass(&self, ids: &BTreeSet<BulletId>, epoch: usize) -> bool {
        let Some(deduplicator) = &self.deduplicator else {
            return true;
        };
        match self.pipeline.playbook().deduplicate(deduplicator, ids).await {
            Ok(outcome) => {
                debug!(epoch, retired = outcome.retired(), "Deduplication pass done");
                true
            }
            Err(e) => {
                error!(
                    epoch,
                    candidates = ids.len(),
                    error = %format!("{e:#}"),
                    "Deduplication failed, playbook left as is"
                );
                false
            }
        }
    }
}

/// Run every sample through [`AdapterPipeline::evaluate_only`].
pub async fn evaluate_frozen<G, R, C, E>(
    pipeline: &AdapterPipeline<G, R, C>,
    samples: &[Sample],
    env: &mut E,
    output_dir: Option<&Path>,
) -> Result<RunReport>
where
    G: Generator,
    R: Reflector,
    C: Curator,
    E: Environment,
{
    let mut log = RunLog::open(output_dir)?;
    info!(samples = samples.len(), "Evaluating frozen playbook");

    for (index, sample) in samples.iter().enumerate() {
        let outcome = pipeline
            .evaluate_only(sample, env, SampleSlot::evaluation(index))
            .await
            .with_context(|| format!("evaluation of sample {index} ({}) failed", sample.task_id))?;
        log.record(outcome.metrics);
    }

    let report = log.finish(
        pipeline.config().sgc_threshold,
        0,
        pipeline.playbook().len().await,
    );
    if let Some(dir) = output_dir {
        save_summary(dir, "evaluation_summary.json", &report.summary)?;
    }
    info!(
        tasks = report.summary.tasks,
        mean_tgc = report.summary.mean_tgc,
        sgc = report.summary.sgc,
        "Evaluation complete"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AdaptationConfig;
    use crate::env::{MockSandboxEnv, MockScript};
    use crate::playbook::{Playbook, SharedPlaybook};
    use crate::testing::{CountingDeduplicator, EchoCurator, FixedReflector, ScriptedGenerator};
    use crate::trajectory::TerminationReason;

    fn samples(n: usize) -> Vec<Sample> {
        (0..n)
            .map(|i| Sample::new(format!("task-{i}"), format!("Solve task {i}")))
            .collect()
    }

    fn pipeline(
        reflector: FixedReflector,
    ) -> AdapterPipeline<ScriptedGenerator, FixedReflector, EchoCurator> {
        AdapterPipeline::new(
            ScriptedGenerator::default(),
            reflector,
            EchoCurator,
            SharedPlaybook::default(),
            AdaptationConfig::default(),
        )
    }

    fn config(epochs: usize) -> OfflineConfig {
        OfflineConfig {
            epochs,
            ..OfflineConfig::default()
        }
    }

    #[tokio::test]
    async fn test_runs_every_sample_every_epoch_in_order() {
        let adapter = OfflineAdapter::new(pipeline(FixedReflector::per_task()), config(2));
        let mut env = MockSandboxEnv::new();

        let report = adapter.run(&samples(3), &mut env).await.unwrap();

        let order: Vec<_> = report
            .records
            .iter()
            .map(|r| (r.epoch, r.task_id.as_str()))
            .collect();
        assert_eq!(
            order,
            vec![
                (Some(1), "task-0"),
                (Some(1), "task-1"),
                (Some(1), "task-2"),
                (Some(2), "task-0"),
                (Some(2), "task-1"),
                (Some(2), "task-2"),
            ]
        );
        assert_eq!(report.summary.tasks, 6);
        assert_eq!(report.total_steps, 12);
        // One new bullet per processed sample.
        assert_eq!(adapter.pipeline().playbook().len().await, 6);
    }

    #[tokio::test]
    async fn test_end_of_epoch_dedup_only_sees_touched_bullets() {
        let dedup = CountingDeduplicator::default();
        let adapter = OfflineAdapter::new(
            pipeline(FixedReflector::constant("Always paginate list endpoints.")),
            config(2),
        )
        .with_deduplicator(dedup.clone());
        let mut env = MockSandboxEnv::new();

        let report = adapter.run(&samples(3), &mut env).await.unwrap();

        // Each epoch adds three identical bullets; each pass merges them.
        assert_eq!(dedup.calls(), 2);
        assert_eq!(dedup.candidate_counts(), vec![3, 3]);
        let playbook = adapter.pipeline().playbook().snapshot().await;
        assert_eq!(playbook.len(), 2);
        assert_eq!(report.summary.dedup_failures, 0);
        assert_eq!(report.summary.playbook_size, 2);
        // Identifiers are never reassigned after a merge.
        assert_eq!(playbook.next_id(), BulletId::new(7));
    }

    #[tokio::test]
    async fn test_dedup_failure_is_counted_not_fatal() {
        let dedup = CountingDeduplicator::failing();
        let adapter = OfflineAdapter::new(
            pipeline(FixedReflector::constant("Same tip.")),
            config(1),
        )
        .with_deduplicator(dedup.clone());
        let mut env = MockSandboxEnv::new();

        let report = adapter.run(&samples(2), &mut env).await.unwrap();

        assert_eq!(dedup.calls(), 1);
        assert_eq!(report.summary.dedup_failures, 1);
        assert_eq!(adapter.pipeline().playbook().len().await, 2);
    }

    #[tokio::test]
    async fn test_periodic_dedup() {
        let dedup = CountingDeduplicator::default();
        let adapter = OfflineAdapter::new(
            pipeline(FixedReflector::constant("Same tip.")),
            OfflineConfig {
                epochs: 1,
                dedup_every: 2,
            },
        )
        .with_deduplicator(dedup.clone());
        let mut env = MockSandboxEnv::new();

        adapter.run(&samples(4), &mut env).await.unwrap();

        // After sample 2, then at the end of the epoch.
        assert_eq!(dedup.calls(), 2);
        assert_eq!(dedup.candidate_counts(), vec![2, 3]);
        assert_eq!(adapter.pipeline().playbook().len().await, 1);
    }

    #[tokio::test]
    async fn test_structural_failure_aborts_run() {
        let adapter = OfflineAdapter::new(pipeline(FixedReflector::failing()), config(1));
        let mut env = MockSandboxEnv::new();

        let err = adapter.run(&samples(2), &mut env).await.unwrap_err();
        assert!(format!("{err:#}").contains("task-0"));
        assert_eq!(env.sessions.len(), 1);
    }

    #[tokio::test]
    async fn test_unopened_session_does_not_stop_the_run() {
        let adapter = OfflineAdapter::new(pipeline(FixedReflector::per_task()), config(1));
        let mut env = MockSandboxEnv::new().with_script(
            "task-1",
            MockScript {
                fail_initialize: true,
                ..MockScript::default()
            },
        );

        let report = adapter.run(&samples(4), &mut env).await.unwrap();

        assert_eq!(env.sessions, vec!["task-0", "task-2", "task-3"]);
        assert_eq!(report.summary.tasks, 4);
        let failed = &report.records[1];
        assert_eq!(failed.task_id, "task-1");
        assert_eq!(failed.termination, TerminationReason::ExecutionFatal);
        assert_eq!((failed.num_steps, failed.tgc), (0, 0.0));
        assert_eq!(report.summary.terminations["execution_fatal"], 1);
        assert!((report.summary.sgc - 0.75).abs() < 1e-12);
        // Learning continues around the failed sample.
        assert_eq!(adapter.pipeline().playbook().len().await, 3);
    }

    #[tokio::test]
    async fn test_aborted_run_saves_the_playbook_first() {
        let dir = std::env::temp_dir().join(format!("ace_offline_{}", uuid::Uuid::new_v4()));
        let adapter = OfflineAdapter::new(
            pipeline(FixedReflector::failing_on("task-2")),
            config(1),
        )
        .with_output_dir(&dir);
        let mut env = MockSandboxEnv::new();

        let err = adapter.run(&samples(4), &mut env).await.unwrap_err();
        let saved = Playbook::load_from_file(dir.join("playbook.json")).unwrap();
        std::fs::remove_dir_all(&dir).ok();

        assert!(format!("{err:#}").contains("task-2"));
        assert_eq!(saved.len(), 2);
    }

    #[tokio::test]
    async fn test_zero_epochs_rejected() {
        let adapter = OfflineAdapter::new(pipeline(FixedReflector::per_task()), config(0));
        let mut env = MockSandboxEnv::new();
        assert!(adapter.run(&samples(1), &mut env).await.is_err());
        assert!(env.sessions.is_empty());
    }

    #[tokio::test]
    async fn test_outputs_written() {
        let dir = std::env::temp_dir().join(format!("ace_offline_{}", uuid::Uuid::new_v4()));
        let adapter = OfflineAdapter::new(pipeline(FixedReflector::per_task()), config(2))
            .with_output_dir(&dir);
        let mut env = MockSandboxEnv::with_default(MockScript::completing_after(1));

        adapter.run(&samples(2), &mut env).await.unwrap();

        let reloaded = Playbook::load_from_file(dir.join("playbook.json")).unwrap();
        let first_epoch =
            Playbook::load_from_file(dir.join("playbook_epoch_1.json")).unwrap();
        let records = crate::adaptation::metrics::MetricsLog::read_all(dir.join("metrics.jsonl")).unwrap();
        let summary_exists = dir.join("offline_summary.json").exists();
        std::fs::remove_dir_all(&dir).ok();

        assert_eq!(reloaded.len(), 4);
        assert_eq!(first_epoch.len(), 2);
        assert_eq!(records.len(), 4);
        assert!(summary_exists);
    }

    #[tokio::test]
    async fn test_evaluate_does_not_learn() {
        let adapter = OfflineAdapter::new(pipeline(FixedReflector::per_task()), config(1));
        let mut env = MockSandboxEnv::new();

        let report = adapter.evaluate(&samples(3), &mut env).await.unwrap();

        assert_eq!(report.summary.tasks, 3);
        assert!((report.summary.sgc - 1.0).abs() < 1e-12);
        assert_eq!(adapter.pipeline().playbook().len().await, 0);
    }
}
