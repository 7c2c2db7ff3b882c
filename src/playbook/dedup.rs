//! Near-duplicate detection over playbook bullets.
//!
//! A [`Deduplicator`] looks at a candidate snapshot and returns a
//! [`DedupPlan`]; the playbook validates and applies it. Both concrete
//! deduplicators use the same greedy clustering:
//!
//! 1. Walk candidates in insertion order.
//! 2. Compare each one against the representatives chosen so far.
//! 3. If the best-scoring representative is a duplicate, merge into it;
//!    otherwise the candidate becomes a new representative.
//!
//! Survivors keep their own content, so representatives are pairwise
//! non-duplicates and re-running the plan over the result changes nothing.

use anyhow::{ensure, Result};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::types::{Bullet, BulletId};
use crate::config::{DedupConfig, DedupStrategy, ModelConfig};
use crate::model::EmbeddingClient;

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// One merge: `absorbed` bullets are retired into `into`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Merge {
    pub into: BulletId,
    pub absorbed: Vec<BulletId>,
    /// Replacement content for the survivor; `None` keeps its current text.
    #[serde(default)]
    pub content: Option<String>,
}

/// Partition of a candidate set into kept, merged and removed bullets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DedupPlan {
    pub keep: Vec<BulletId>,
    pub merges: Vec<Merge>,
    pub remove: Vec<BulletId>,
}

impl DedupPlan {
    /// `true` if applying the plan would retire nothing.
    pub fn is_noop(&self) -> bool {
        self.remove.is_empty() && self.merges.iter().all(|m| m.absorbed.is_empty())
    }
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Capability that proposes merges and removals among candidate bullets.
#[allow(async_fn_in_trait)]
pub trait Deduplicator {
    async fn deduplicate(&self, candidates: &[Bullet]) -> Result<DedupPlan>;
}

/// Computes the cosine similarity between two vectors.
///
/// Returns 0.0 for mismatched lengths or a zero vector.
pub fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f64 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f64 = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| x * x).sum::<f64>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}

/// Greedy clustering shared by the concrete deduplicators.
///
/// `score(i, j)` returns the similarity of candidates `i` and `j` if they are
/// duplicates, `None` otherwise.
fn greedy_plan(
    candidates: &[Bullet],
    score: impl Fn(usize, usize) -> Option<f64>,
) -> DedupPlan {
    let mut reps: Vec<usize> = Vec::new();
    let mut absorbed: Vec<Vec<BulletId>> = Vec::new();

    for i in 0..candidates.len() {
        let best = reps
            .iter()
            .enumerate()
            .filter_map(|(slot, &rep)| score(i, rep).map(|s| (OrderedFloat(s), slot)))
            .max_by_key(|(s, _)| *s);

        match best {
            Some((_, slot)) => absorbed[slot].push(candidates[i].id),
            None => {
                reps.push(i);
                absorbed.push(Vec::new());
            }
        }
    }

    let keep = reps.iter().map(|&r| candidates[r].id).collect();
    let merges = reps
        .iter()
        .zip(absorbed)
        .filter(|(_, absorbed)| !absorbed.is_empty())
        .map(|(&r, absorbed)| Merge {
            into: candidates[r].id,
            absorbed,
            content: None,
        })
        .collect();

    DedupPlan {
        keep,
        merges,
        remove: Vec::new(),
    }
}

// ---------------------------------------------------------------------------
// Embedding similarity
// ---------------------------------------------------------------------------

/// Merges bullets whose content embeddings exceed a cosine threshold.
#[derive(Debug, Clone)]
pub struct EmbeddingDeduplicator {
    client: EmbeddingClient,
    threshold: f64,
}

impl EmbeddingDeduplicator {
    pub fn new(client: EmbeddingClient, threshold: f64) -> Self {
        Self { client, threshold }
    }
}

impl Deduplicator for EmbeddingDeduplicator {
    async fn deduplicate(&self, candidates: &[Bullet]) -> Result<DedupPlan> {
        let texts: Vec<String> = candidates.iter().map(|b| b.content.clone()).collect();
        let embeddings = self.client.embed_batch(&texts).await?;
        ensure!(
            embeddings.len() == candidates.len(),
            "embedding API returned {} vectors for {} bullets",
            embeddings.len(),
            candidates.len()
        );

        let plan = greedy_plan(candidates, |i, j| {
            let sim = cosine_similarity(&embeddings[i], &embeddings[j]);
            (sim >= self.threshold).then_some(sim)
        });
        debug!(
            candidates = candidates.len(),
            survivors = plan.keep.len(),
            threshold = self.threshold,
            "Embedding deduplication planned"
        );
        Ok(plan)
    }
}

// ---------------------------------------------------------------------------
// Lexical similarity
// ---------------------------------------------------------------------------

/// Merges bullets whose normalised text is equal or contained in one another.
///
/// Used when no embedding endpoint is available.
#[derive(Debug, Clone, Copy, Default)]
pub struct LexicalDeduplicator;

fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
        .trim_end_matches(['.', '!', ';'])
        .to_string()
}

impl Deduplicator for LexicalDeduplicator {
    async fn deduplicate(&self, candidates: &[Bullet]) -> Result<DedupPlan> {
        let normalized: Vec<String> = candidates.iter().map(|b| normalize(&b.content)).collect();
        Ok(greedy_plan(candidates, |i, j| {
            let (a, b) = (&normalized[i], &normalized[j]);
            if a == b {
                Some(1.0)
            } else if !a.is_empty() && !b.is_empty() && (a.contains(b.as_str()) || b.contains(a.as_str())) {
                Some(0.9)
            } else {
                None
            }
        }))
    }
}

// ---------------------------------------------------------------------------
// Runtime selection
// ---------------------------------------------------------------------------

/// Enum dispatch over the available deduplicators.
#[derive(Debug, Clone)]
pub enum AnyDeduplicator {
    Embedding(EmbeddingDeduplicator),
    Lexical(LexicalDeduplicator),
}

impl AnyDeduplicator {
    /// Build the configured deduplicator, or `None` when deduplication is disabled.
    pub fn from_config(dedup: &DedupConfig, model: &ModelConfig) -> Option<Self> {
        if !dedup.enabled {
            return None;
        }
        Some(match dedup.strategy {
            DedupStrategy::Embedding => {
                let client = EmbeddingClient::new(
                    &model.embedding_api_base,
                    &model.embedding_api_key,
                    &model.embedding_model_id,
                );
                Self::Embedding(EmbeddingDeduplicator::new(client, dedup.similarity_threshold))
            }
            DedupStrategy::Lexical => Self::Lexical(LexicalDeduplicator),
        })
    }
}

impl Deduplicator for AnyDeduplicator {
    async fn deduplicate(&self, candidates: &[Bullet]) -> Result<DedupPlan> {
        match self {
            Self::Embedding(d) => d.deduplicate(candidates).await,
            Self::Lexical(d) => d.deduplicate(candidates).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playbook::{Playbook, Provenance};

    fn bullets(contents: &[&str]) -> Vec<Bullet> {
        let mut pb = Playbook::new();
        for c in contents {
            pb.insert("s", *c, Provenance::new("t", None));
        }
        pb.bullets().cloned().collect()
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-9);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-9);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn test_greedy_plan_picks_best_representative() {
        let cands = bullets(&["a", "b", "c"]);
        // c is similar to both a and b but closer to b.
        let plan = greedy_plan(&cands, |i, j| match (i, j) {
            (2, 0) => Some(0.85),
            (2, 1) => Some(0.95),
            _ => None,
        });
        assert_eq!(plan.keep, vec![cands[0].id, cands[1].id]);
        assert_eq!(
            plan.merges,
            vec![Merge {
                into: cands[1].id,
                absorbed: vec![cands[2].id],
                content: None,
            }]
        );
    }

    #[tokio::test]
    async fn test_lexical_merges_equal_and_contained_text() {
        let cands = bullets(&[
            "Use pagination for list APIs.",
            "use pagination   for list apis",
            "Always use pagination for list APIs when results may exceed one page",
            "Verify the phone number format",
        ]);
        let plan = LexicalDeduplicator.deduplicate(&cands).await.unwrap();

        assert_eq!(plan.keep, vec![cands[0].id, cands[3].id]);
        assert_eq!(plan.merges.len(), 1);
        assert_eq!(plan.merges[0].absorbed, vec![cands[1].id, cands[2].id]);
        assert!(plan.remove.is_empty());
    }

    #[tokio::test]
    async fn test_lexical_plan_on_survivors_is_noop() {
        let cands = bullets(&["Check limits", "check limits", "Log in first"]);
        let plan = LexicalDeduplicator.deduplicate(&cands).await.unwrap();
        let survivors: Vec<Bullet> = cands
            .into_iter()
            .filter(|b| plan.keep.contains(&b.id))
            .collect();

        let again = LexicalDeduplicator.deduplicate(&survivors).await.unwrap();
        assert!(again.is_noop());
    }

    #[test]
    fn test_disabled_config_builds_nothing() {
        let mut cfg = DedupConfig::default();
        cfg.enabled = false;
        assert!(AnyDeduplicator::from_config(&cfg, &ModelConfig::default()).is_none());

        cfg.enabled = true;
        cfg.strategy = DedupStrategy::Lexical;
        assert!(matches!(
            AnyDeduplicator::from_config(&cfg, &ModelConfig::default()),
            Some(AnyDeduplicator::Lexical(_))
        ));
    }
}
