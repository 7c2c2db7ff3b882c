//! Typed failures of the adaptation loop.
//!
//! Capability implementations report failures as `anyhow::Error`; the pipeline
//! wraps the ones that are structural (reflection, curation, playbook writes)
//! into [`AdapterError`] so drivers can tell them apart from data-level
//! execution errors, which never leave the trajectory.

use thiserror::Error;

use crate::playbook::BulletId;

/// Rejections raised while validating a write against the playbook.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlaybookError {
    /// An operation referenced an identifier that is not live.
    #[error("unknown or retired bullet {0}")]
    UnknownBullet(BulletId),

    /// An add or update carried no content.
    #[error("bullet content is empty{}", .0.map(|id| format!(" (bullet {id})")).unwrap_or_default())]
    EmptyContent(Option<BulletId>),

    /// A deduplication plan is internally inconsistent.
    #[error("invalid deduplication plan: {0}")]
    InvalidPlan(String),

    /// A deduplication plan was computed against bullets that changed since.
    #[error("deduplication plan is stale: bullet {0} changed while it was computed")]
    Stale(BulletId),
}

/// Structural failures of [`AdapterPipeline::process`](crate::adaptation::AdapterPipeline::process).
#[derive(Error, Debug)]
pub enum AdapterError {
    /// The step loop drove the trajectory recorder out of order.
    #[error("trajectory recording failed for task {task_id}")]
    Recorder {
        task_id: String,
        #[source]
        source: anyhow::Error,
    },

    /// The reflector failed or produced malformed output.
    #[error("reflection failed for task {task_id}")]
    Reflect {
        task_id: String,
        #[source]
        source: anyhow::Error,
    },

    /// The curator failed or produced malformed output.
    #[error("curation failed for task {task_id}")]
    Curate {
        task_id: String,
        #[source]
        source: anyhow::Error,
    },

    /// The curator's delta was rejected; the playbook is unchanged.
    #[error("curator delta for task {task_id} rejected")]
    Playbook {
        task_id: String,
        #[source]
        source: PlaybookError,
    },
}

/// Failures while pulling samples from a JSON-lines stream.
#[derive(Error, Debug)]
pub enum SampleError {
    /// One line did not parse; later lines are still read.
    #[error("malformed sample on line {line}")]
    Malformed {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    /// The reader failed; the stream ends here.
    #[error("failed to read sample stream")]
    Read(#[from] std::io::Error),
}

impl AdapterError {
    /// The task the failure belongs to.
    pub fn task_id(&self) -> &str {
        match self {
            Self::Recorder { task_id, .. }
            | Self::Reflect { task_id, .. }
            | Self::Curate { task_id, .. }
            | Self::Playbook { task_id, .. } => task_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn playbook_error_messages() {
        assert_eq!(
            PlaybookError::UnknownBullet(BulletId::new(7)).to_string(),
            "unknown or retired bullet b-00007"
        );
        assert_eq!(PlaybookError::EmptyContent(None).to_string(), "bullet content is empty");
        assert_eq!(
            PlaybookError::EmptyContent(Some(BulletId::new(3))).to_string(),
            "bullet content is empty (bullet b-00003)"
        );
    }

    #[test]
    fn adapter_error_keeps_task_and_source() {
        let err = AdapterError::Curate {
            task_id: "task-1".into(),
            source: anyhow::anyhow!("missing operations field"),
        };
        assert_eq!(err.task_id(), "task-1");
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("missing operations field"));
    }

    #[test]
    fn sample_error_names_the_line() {
        let source = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err = SampleError::Malformed { line: 4, source };
        assert_eq!(err.to_string(), "malformed sample on line 4");
        assert!(std::error::Error::source(&err).is_some());
    }
}
