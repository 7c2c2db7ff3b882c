//! Samples, trajectories and the per-sample step recorder.
//!
//! This module provides:
//! - [`types::Sample`], [`types::Step`], [`types::Trajectory`] -- the data
//!   structures describing a task and one attempt at it.
//! - [`recorder::TrajectoryRecorder`] -- the state machine that accumulates
//!   steps and decides when an attempt is over.

pub mod recorder;
pub mod types;

pub use recorder::{RecorderState, TrajectoryRecorder};
pub use types::{load_samples, Sample, SampleContext, Step, TerminationReason, Trajectory};
