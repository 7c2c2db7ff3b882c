//! The adaptation loop and its two drivers.
//!
//! 1. **Pipeline** ([`pipeline`]) -- [`AdapterPipeline::process`], the
//!    per-sample generate, execute, evaluate, reflect, curate cycle.
//! 2. **Offline** ([`offline`]) -- [`OfflineAdapter`], multiple epochs over
//!    a fixed collection with end-of-epoch deduplication.
//! 3. **Online** ([`online`]) -- [`OnlineAdapter`], one pass over a sample
//!    stream, never deduplicating.
//! 4. **Metrics** ([`metrics`]) -- per-task records, the JSONL log and the
//!    run summary (TGC / SGC).

pub mod metrics;
pub mod offline;
pub mod online;
pub mod pipeline;

pub use metrics::{tgc, MetricsLog, Phase, RunReport, RunSummary, TaskMetrics};
pub use offline::{evaluate_frozen, OfflineAdapter};
pub use online::{jsonl_samples, OnlineAdapter};
pub use pipeline::{AdapterPipeline, ProcessOutcome, SampleSlot};
