//! Synchronised playbook handle shared by every in-flight sample.
//!
//! Readers take a cloned snapshot under the read lock. Writers validate and
//! apply under the write lock without awaiting anything while it is held, so
//! a write is either fully visible or not at all, and dropping a caller's
//! future can never leave a half-applied change.
//!
//! Deduplication reads its candidates under the read lock, calls the
//! deduplicator with no lock held, then re-takes the write lock and rejects
//! the plan as stale if any candidate changed in the meantime.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::RwLock;

use super::dedup::Deduplicator;
use super::library::{DedupOutcome, Playbook};
use super::types::{BulletId, BulletTag, CuratorDelta, Provenance};
use crate::error::PlaybookError;

#[derive(Debug, Clone, Default)]
pub struct SharedPlaybook {
    inner: Arc<RwLock<Playbook>>,
}

impl SharedPlaybook {
    pub fn new(playbook: Playbook) -> Self {
        Self {
            inner: Arc::new(RwLock::new(playbook)),
        }
    }

    /// A consistent copy of the current state.
    pub async fn snapshot(&self) -> Playbook {
        self.inner.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Apply reflector tags and a curator delta atomically.
    pub async fn apply_delta(
        &self,
        delta: &CuratorDelta,
        tags: &[BulletTag],
        provenance: &Provenance,
    ) -> Result<Vec<BulletId>, PlaybookError> {
        let mut playbook = self.inner.write().await;
        playbook.apply_delta(delta, tags, provenance)
    }

    /// Deduplicate the live bullets among `candidate_ids`.
    pub async fn deduplicate<D: Deduplicator>(
        &self,
        deduplicator: &D,
        candidate_ids: &BTreeSet<BulletId>,
    ) -> Result<DedupOutcome> {
        let candidates = self.inner.read().await.candidates(candidate_ids);
        if candidates.len() < 2 {
            return Ok(DedupOutcome {
                candidates: candidates.len(),
                ..DedupOutcome::default()
            });
        }

        let plan = deduplicator
            .deduplicate(&candidates)
            .await
            .context("Deduplicator failed")?;
        if plan.is_noop() {
            tracing::debug!(candidates = candidates.len(), "No duplicates found");
            return Ok(DedupOutcome {
                candidates: candidates.len(),
                ..DedupOutcome::default()
            });
        }

        let mut playbook = self.inner.write().await;
        let outcome = playbook.apply_dedup_plan(&candidates, &plan)?;
        tracing::info!(
            candidates = outcome.candidates,
            merged = outcome.merged.len(),
            removed = outcome.removed.len(),
            bullets = playbook.len(),
            "Deduplicated playbook"
        );
        Ok(outcome)
    }

    /// Persist a snapshot; the lock is released before touching the filesystem.
    pub async fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let snapshot = self.snapshot().await;
        snapshot
            .save_to_file(path.as_ref())
            .with_context(|| format!("Failed to save playbook to {}", path.as_ref().display()))
    }
}
