//! Single-pass adaptation over a sample stream.
//!
//! Samples are pulled one at a time from any [`Stream`]; waiting for the
//! next sample is a suspension point and the length need not be known.
//! There are no epochs and no deduplication: touched identifiers are dropped
//! as soon as a sample is processed.
//!
//! Streams read from JSON lines ([`jsonl_samples`]) go through
//! [`OnlineAdapter::run_fallible`]: a malformed line is skipped and counted in
//! the run summary, a read error ends the run with an error.

use std::path::{Path, PathBuf};
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use futures::{Stream, StreamExt};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{info, warn};

use super::metrics::{save_before_abort, save_summary, RunLog, RunReport};
use super::pipeline::{AdapterPipeline, SampleSlot};
use crate::config::OnlineConfig;
use crate::env::Environment;
use crate::error::SampleError;
use crate::roles::{Curator, Generator, Reflector};
use crate::trajectory::Sample;

pub struct OnlineAdapter<G, R, C> {
    pipeline: AdapterPipeline<G, R, C>,
    config: OnlineConfig,
    output_dir: Option<PathBuf>,
    stop: Arc<AtomicBool>,
}

impl<G: Generator, R: Reflector, C: Curator> OnlineAdapter<G, R, C> {
    pub fn new(pipeline: AdapterPipeline<G, R, C>, config: OnlineConfig) -> Self {
        Self {
            pipeline,
            config,
            output_dir: None,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Save the playbook, metrics and run summary under `dir`.
    pub fn with_output_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.output_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn pipeline(&self) -> &AdapterPipeline<G, R, C> {
        &self.pipeline
    }

    /// Setting the flag stops the run before the next sample is pulled.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Consume `samples` in arrival order until the stream ends, the stop
    /// flag is set, or `max_samples` have been processed.
    pub async fn run<S, E>(&self, samples: S, env: &mut E) -> Result<RunReport>
    where
        S: Stream<Item = Sample>,
        E: Environment,
    {
        self.run_fallible(samples.map(Ok::<_, SampleError>), env)
            .await
    }

    /// [`run`](Self::run) over a stream whose items can fail to read.
    ///
    /// Malformed items are skipped and counted; a read error saves the
    /// playbook and ends the run with that error.
    pub async fn run_fallible<S, E>(&self, samples: S, env: &mut E) -> Result<RunReport>
    where
        S: Stream<Item = Result<Sample, SampleError>>,
        E: Environment,
    {
        let mut samples = pin!(samples);
        let playbook = self.pipeline.playbook();
        let mut log = RunLog::open(self.output_dir.as_deref())?;
        let mut skipped = 0;

        info!(
            max_samples = ?self.config.max_samples,
            save_every = self.config.save_every,
            "Starting online adaptation"
        );

        loop {
            if self.stop.load(Ordering::SeqCst) {
                info!(processed = log.len(), "Stop requested");
                break;
            }
            if self.config.max_samples.is_some_and(|max| log.len() >= max) {
                info!(processed = log.len(), "Sample limit reached");
                break;
            }
            let sample = match samples.next().await {
                None => break,
                Some(Ok(sample)) => sample,
                Some(Err(SampleError::Malformed { line, source })) => {
                    warn!(line, error = %source, "Skipping malformed sample");
                    skipped += 1;
                    continue;
                }
                Some(Err(e)) => {
                    save_before_abort(playbook, self.output_dir.as_deref()).await;
                    let processed = log.len();
                    return Err(anyhow::Error::new(e)
                        .context(format!("sample input failed after {processed} samples")));
                }
            };

            let index = log.len();
            let outcome = match self
                .pipeline
                .process(&sample, env, SampleSlot::online(index))
                .await
            {
                Ok(outcome) => outcome,
                Err(e) => {
                    save_before_abort(playbook, self.output_dir.as_deref()).await;
                    return Err(anyhow::Error::new(e)
                        .context(format!("sample {index} ({}) failed", sample.task_id)));
                }
            };
            log.record(outcome.metrics);

            info!(
                sample = index,
                task_id = %sample.task_id,
                total_steps = log.total_steps(),
                "Online progress"
            );

            let every = self.config.save_every;
            if every > 0 && log.len() % every == 0 {
                self.save_playbook().await?;
            }
        }

        self.save_playbook().await?;
        let mut report =
            log.finish(self.pipeline.config().sgc_threshold, 0, playbook.len().await);
        report.summary.skipped_samples = skipped;
        if let Some(dir) = &self.output_dir {
            save_summary(dir, "online_summary.json", &report.summary)?;
        }
        info!(
            tasks = report.summary.tasks,
            total_steps = report.total_steps,
            mean_tgc = report.summary.mean_tgc,
            sgc = report.summary.sgc,
            skipped,
            "Online adaptation complete"
        );
        Ok(report)
    }

    async fn save_playbook(&self) -> Result<()> {
        match &self.output_dir {
            Some(dir) => self.pipeline.playbook().save_to_file(dir.join("playbook.json")).await,
            None => Ok(()),
        }
    }
}

/// Lazily parse JSON-lines samples from `reader`.
///
/// Blank lines are skipped. A line that does not parse yields
/// [`SampleError::Malformed`] and reading continues; a read error yields
/// [`SampleError::Read`] and ends the stream.
pub fn jsonl_samples<R>(reader: R) -> impl Stream<Item = Result<Sample, SampleError>>
where
    R: AsyncBufRead + Unpin,
{
    futures::stream::unfold(Some((reader.lines(), 0usize)), |state| async move {
        let (mut lines, mut line_no) = state?;
        loop {
            line_no += 1;
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => {
                    let item = serde_json::from_str::<Sample>(&line).map_err(|source| {
                        SampleError::Malformed {
                            line: line_no,
                            source,
                        }
                    });
                    return Some((item, Some((lines, line_no))));
                }
                Ok(None) => return None,
                Err(e) => return Some((Err(SampleError::Read(e)), None)),
            }
        }
    })
}
