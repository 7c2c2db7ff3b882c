//! The ordered playbook store.
//!
//! [`Playbook`] maps [`BulletId`] to [`Bullet`] and iterates in insertion
//! order. All mutation goes through validated batch operations:
//!
//! 1. **Curator deltas** ([`Playbook::apply_delta`]) -- reflector tags plus
//!    add/update/remove operations, validated as a whole before anything is
//!    written.
//! 2. **Deduplication plans** ([`Playbook::apply_dedup_plan`]) -- merges and
//!    removals computed by a [`Deduplicator`](super::Deduplicator) over a
//!    candidate snapshot.
//!
//! Retired identifiers are never handed out again: `next_id` only grows and
//! is persisted with the bullets.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::dedup::DedupPlan;
use super::types::{Bullet, BulletId, BulletTag, CuratorDelta, DeltaOperation, Provenance, TagKind};
use crate::error::PlaybookError;

/// What a deduplication pass changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DedupOutcome {
    /// Number of candidates the deduplicator inspected.
    pub candidates: usize,
    /// Identifiers absorbed into a surviving bullet.
    pub merged: Vec<BulletId>,
    /// Identifiers removed outright.
    pub removed: Vec<BulletId>,
}

impl DedupOutcome {
    pub fn retired(&self) -> usize {
        self.merged.len() + self.removed.len()
    }
}

/// The on-disk form: the allocation counter plus bullets in insertion order.
#[derive(Serialize, Deserialize)]
struct PlaybookFile {
    #[serde(default)]
    next_id: u64,
    bullets: Vec<Bullet>,
}

/// Ordered, identity-stable store of strategy bullets.
#[derive(Debug, Clone)]
pub struct Playbook {
    bullets: BTreeMap<BulletId, Bullet>,
    next_id: u64,
}

impl Playbook {
    pub fn new() -> Self {
        Self {
            bullets: BTreeMap::new(),
            next_id: 1,
        }
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn len(&self) -> usize {
        self.bullets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bullets.is_empty()
    }

    pub fn get(&self, id: BulletId) -> Option<&Bullet> {
        self.bullets.get(&id)
    }

    pub fn contains(&self, id: BulletId) -> bool {
        self.bullets.contains_key(&id)
    }

    /// Live bullets in insertion order.
    pub fn bullets(&self) -> impl Iterator<Item = &Bullet> {
        self.bullets.values()
    }

    pub fn ids(&self) -> Vec<BulletId> {
        self.bullets.keys().copied().collect()
    }

    /// The identifier the next inserted bullet will receive.
    pub fn next_id(&self) -> BulletId {
        BulletId::new(self.next_id)
    }

    /// Bullet count per section, sorted by section name.
    pub fn section_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for bullet in self.bullets.values() {
            *counts.entry(bullet.section.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Render the playbook as prompt text, grouped by section.
    ///
    /// Sections are sorted by name; bullets keep insertion order within a
    /// section.
    pub fn as_prompt(&self) -> String {
        if self.bullets.is_empty() {
            return "(the playbook is empty)".to_string();
        }

        let mut sections: BTreeMap<&str, Vec<&Bullet>> = BTreeMap::new();
        for bullet in self.bullets.values() {
            sections.entry(bullet.section.as_str()).or_default().push(bullet);
        }

        let mut out = String::new();
        for (section, bullets) in sections {
            out.push_str(&format!("## {section}\n"));
            for bullet in bullets {
                out.push_str(&bullet.to_prompt_line());
                out.push('\n');
            }
            out.push('\n');
        }
        out.trim_end().to_string()
    }

    // ------------------------------------------------------------------
    // Mutation
    // ------------------------------------------------------------------

    /// Insert a bullet with a freshly allocated identifier.
    pub fn insert(
        &mut self,
        section: impl Into<String>,
        content: impl Into<String>,
        provenance: Provenance,
    ) -> BulletId {
        let id = BulletId::new(self.next_id);
        self.next_id += 1;
        let bullet = Bullet {
            id,
            section: section.into(),
            content: content.into(),
            updated_at: provenance.created_at,
            provenance,
            helpful: 0,
            harmful: 0,
            merged_from: Vec::new(),
        };
        self.bullets.insert(id, bullet);
        id
    }

    /// Check a curator delta against the current state without changing it.
    ///
    /// Operations are checked in order, so an update of a bullet removed
    /// earlier in the same delta is rejected.
    pub fn validate_delta(&self, delta: &CuratorDelta) -> Result<(), PlaybookError> {
        let mut removed = HashSet::new();
        let live = |id: &BulletId, removed: &HashSet<BulletId>| {
            self.bullets.contains_key(id) && !removed.contains(id)
        };

        for op in &delta.operations {
            match op {
                DeltaOperation::Add { content, .. } => {
                    if content.trim().is_empty() {
                        return Err(PlaybookError::EmptyContent(None));
                    }
                }
                DeltaOperation::Update { bullet_id, content } => {
                    if !live(bullet_id, &removed) {
                        return Err(PlaybookError::UnknownBullet(*bullet_id));
                    }
                    if content.trim().is_empty() {
                        return Err(PlaybookError::EmptyContent(Some(*bullet_id)));
                    }
                }
                DeltaOperation::Remove { bullet_id } => {
                    if !live(bullet_id, &removed) {
                        return Err(PlaybookError::UnknownBullet(*bullet_id));
                    }
                    removed.insert(*bullet_id);
                }
            }
        }
        Ok(())
    }

    /// Apply reflector tags and a curator delta as one write.
    ///
    /// The delta is validated first; on rejection nothing (tags included)
    /// is applied. Returns the identifiers of bullets added or updated, in
    /// operation order.
    pub fn apply_delta(
        &mut self,
        delta: &CuratorDelta,
        tags: &[BulletTag],
        provenance: &Provenance,
    ) -> Result<Vec<BulletId>, PlaybookError> {
        self.validate_delta(delta)?;
        self.apply_tags(tags);

        let mut touched = Vec::new();
        for op in &delta.operations {
            match op {
                DeltaOperation::Add { section, content } => {
                    let id = self.insert(section.clone(), content.trim(), provenance.clone());
                    touched.push(id);
                }
                DeltaOperation::Update { bullet_id, content } => {
                    if let Some(bullet) = self.bullets.get_mut(bullet_id) {
                        bullet.content = content.trim().to_string();
                        bullet.updated_at = Utc::now();
                        if !touched.contains(bullet_id) {
                            touched.push(*bullet_id);
                        }
                    }
                }
                DeltaOperation::Remove { bullet_id } => {
                    self.bullets.remove(bullet_id);
                    touched.retain(|id| id != bullet_id);
                }
            }
        }

        tracing::debug!(
            operations = delta.operations.len(),
            touched = touched.len(),
            bullets = self.bullets.len(),
            "Applied curator delta"
        );
        Ok(touched)
    }

    /// Increment helpful/harmful counters. Tags on unknown bullets are skipped.
    ///
    /// Returns the number of tags that matched a live bullet.
    pub fn apply_tags(&mut self, tags: &[BulletTag]) -> usize {
        let mut applied = 0;
        for tag in tags {
            let Some(bullet) = self.bullets.get_mut(&tag.id) else {
                tracing::warn!(bullet = %tag.id, "Ignoring tag on unknown bullet");
                continue;
            };
            match tag.tag {
                TagKind::Helpful => bullet.helpful += 1,
                TagKind::Harmful => bullet.harmful += 1,
                TagKind::Neutral => {}
            }
            applied += 1;
        }
        applied
    }

    // ------------------------------------------------------------------
    // Deduplication
    // ------------------------------------------------------------------

    /// Clone the live bullets among `ids`, in insertion order.
    pub fn candidates(&self, ids: &BTreeSet<BulletId>) -> Vec<Bullet> {
        ids.iter()
            .filter_map(|id| self.bullets.get(id))
            .cloned()
            .collect()
    }

    /// Apply a plan computed over `candidates`.
    ///
    /// The plan may only reference candidates, must not mention an identifier
    /// in more than one role, and every candidate it references must still
    /// hold the content it had when the snapshot was taken. Candidates the
    /// plan does not mention are kept.
    pub fn apply_dedup_plan(
        &mut self,
        candidates: &[Bullet],
        plan: &DedupPlan,
    ) -> Result<DedupOutcome, PlaybookError> {
        let snapshot: BTreeMap<BulletId, &Bullet> =
            candidates.iter().map(|b| (b.id, b)).collect();

        let mut roles: HashSet<BulletId> = HashSet::new();
        let mut claim = |id: BulletId| -> Result<(), PlaybookError> {
            if !snapshot.contains_key(&id) {
                return Err(PlaybookError::InvalidPlan(format!("{id} is not a candidate")));
            }
            if !roles.insert(id) {
                return Err(PlaybookError::InvalidPlan(format!(
                    "{id} appears more than once"
                )));
            }
            Ok(())
        };
        for id in &plan.keep {
            claim(*id)?;
        }
        for merge in &plan.merges {
            for id in &merge.absorbed {
                if *id == merge.into {
                    return Err(PlaybookError::InvalidPlan(format!(
                        "{id} cannot be merged into itself"
                    )));
                }
                claim(*id)?;
            }
        }
        for id in &plan.remove {
            claim(*id)?;
        }

        let retired: HashSet<BulletId> = plan
            .merges
            .iter()
            .flat_map(|m| m.absorbed.iter().copied())
            .chain(plan.remove.iter().copied())
            .collect();
        for merge in &plan.merges {
            if !snapshot.contains_key(&merge.into) {
                return Err(PlaybookError::InvalidPlan(format!(
                    "merge target {} is not a candidate",
                    merge.into
                )));
            }
            if retired.contains(&merge.into) {
                return Err(PlaybookError::InvalidPlan(format!(
                    "merge target {} is also retired",
                    merge.into
                )));
            }
            if let Some(content) = &merge.content {
                if content.trim().is_empty() {
                    return Err(PlaybookError::EmptyContent(Some(merge.into)));
                }
            }
        }

        for (id, seen) in &snapshot {
            match self.bullets.get(id) {
                Some(current) if current.content == seen.content => {}
                _ => return Err(PlaybookError::Stale(*id)),
            }
        }

        // Validated; from here on nothing can fail.
        let mut outcome = DedupOutcome {
            candidates: candidates.len(),
            ..DedupOutcome::default()
        };
        for merge in &plan.merges {
            let mut helpful = 0;
            let mut harmful = 0;
            for id in &merge.absorbed {
                if let Some(absorbed) = self.bullets.remove(id) {
                    helpful += absorbed.helpful;
                    harmful += absorbed.harmful;
                    outcome.merged.push(*id);
                }
            }
            if let Some(survivor) = self.bullets.get_mut(&merge.into) {
                survivor.helpful += helpful;
                survivor.harmful += harmful;
                survivor.merged_from.extend(merge.absorbed.iter().copied());
                if let Some(content) = &merge.content {
                    survivor.content = content.trim().to_string();
                }
                survivor.updated_at = Utc::now();
            }
        }
        for id in &plan.remove {
            if self.bullets.remove(id).is_some() {
                outcome.removed.push(*id);
            }
        }
        Ok(outcome)
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Serialize the playbook to a JSON file at the given path.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = PlaybookFile {
            next_id: self.next_id,
            bullets: self.bullets.values().cloned().collect(),
        };
        let json =
            serde_json::to_string_pretty(&file).context("Failed to serialize playbook to JSON")?;
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create directory {}", parent.display())
                })?;
            }
        }
        std::fs::write(path.as_ref(), json)
            .with_context(|| format!("Failed to write playbook to {}", path.as_ref().display()))?;
        tracing::info!(
            path = %path.as_ref().display(),
            bullets = self.len(),
            "Saved playbook"
        );
        Ok(())
    }

    /// Deserialize a playbook from a JSON file.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read_to_string(path.as_ref()).with_context(|| {
            format!("Failed to read playbook from {}", path.as_ref().display())
        })?;
        let file: PlaybookFile =
            serde_json::from_str(&data).context("Failed to deserialize playbook JSON")?;

        let mut bullets = BTreeMap::new();
        for bullet in file.bullets {
            let id = bullet.id;
            if bullets.insert(id, bullet).is_some() {
                bail!("Duplicate bullet id {id} in {}", path.as_ref().display());
            }
        }
        let max_seq = bullets.keys().next_back().map(|id| id.seq()).unwrap_or(0);
        let playbook = Self {
            bullets,
            next_id: file.next_id.max(max_seq + 1),
        };
        tracing::info!(
            path = %path.as_ref().display(),
            bullets = playbook.len(),
            "Loaded playbook"
        );
        Ok(playbook)
    }
}

impl Default for Playbook {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playbook::dedup::Merge;

    fn prov() -> Provenance {
        Provenance::new("task-1", Some(1))
    }

    fn add(content: &str) -> DeltaOperation {
        DeltaOperation::Add {
            section: "strategies".into(),
            content: content.into(),
        }
    }

    fn delta(operations: Vec<DeltaOperation>) -> CuratorDelta {
        CuratorDelta {
            reasoning: String::new(),
            operations,
        }
    }

    #[test]
    fn test_ids_are_monotonic_and_never_reused() {
        let mut pb = Playbook::new();
        let a = pb.insert("s", "a", prov());
        let b = pb.insert("s", "b", prov());
        pb.apply_delta(&delta(vec![DeltaOperation::Remove { bullet_id: b }]), &[], &prov())
            .unwrap();
        let c = pb.insert("s", "c", prov());

        assert_eq!(a, BulletId::new(1));
        assert_eq!(b, BulletId::new(2));
        assert_eq!(c, BulletId::new(3));
        assert_eq!(pb.ids(), vec![a, c]);
    }

    #[test]
    fn test_apply_delta_returns_touched_ids() {
        let mut pb = Playbook::new();
        let existing = pb.insert("s", "old advice", prov());
        let touched = pb
            .apply_delta(
                &delta(vec![
                    add("Use the page_index parameter."),
                    DeltaOperation::Update {
                        bullet_id: existing,
                        content: "new advice".into(),
                    },
                ]),
                &[],
                &prov(),
            )
            .unwrap();

        assert_eq!(touched, vec![BulletId::new(2), existing]);
        assert_eq!(pb.get(existing).unwrap().content, "new advice");
        assert_eq!(pb.len(), 2);
    }

    #[test]
    fn test_invalid_delta_leaves_playbook_untouched() {
        let mut pb = Playbook::new();
        let id = pb.insert("s", "keep me", prov());
        let tags = vec![BulletTag {
            id,
            tag: TagKind::Helpful,
        }];

        let err = pb
            .apply_delta(
                &delta(vec![
                    add("fine"),
                    DeltaOperation::Update {
                        bullet_id: BulletId::new(99),
                        content: "x".into(),
                    },
                ]),
                &tags,
                &prov(),
            )
            .unwrap_err();

        assert_eq!(err, PlaybookError::UnknownBullet(BulletId::new(99)));
        assert_eq!(pb.len(), 1);
        assert_eq!(pb.get(id).unwrap().helpful, 0);
        assert_eq!(pb.next_id(), BulletId::new(2));
    }

    #[test]
    fn test_update_after_remove_in_same_delta_is_rejected() {
        let mut pb = Playbook::new();
        let id = pb.insert("s", "a", prov());
        let err = pb
            .apply_delta(
                &delta(vec![
                    DeltaOperation::Remove { bullet_id: id },
                    DeltaOperation::Update {
                        bullet_id: id,
                        content: "b".into(),
                    },
                ]),
                &[],
                &prov(),
            )
            .unwrap_err();
        assert_eq!(err, PlaybookError::UnknownBullet(id));
        assert!(pb.contains(id));
    }

    #[test]
    fn test_empty_content_is_rejected() {
        let mut pb = Playbook::new();
        let err = pb
            .apply_delta(&delta(vec![add("   ")]), &[], &prov())
            .unwrap_err();
        assert_eq!(err, PlaybookError::EmptyContent(None));
        assert!(pb.is_empty());
    }

    #[test]
    fn test_tags_update_counters_and_skip_unknown() {
        let mut pb = Playbook::new();
        let id = pb.insert("s", "a", prov());
        let applied = pb.apply_tags(&[
            BulletTag {
                id,
                tag: TagKind::Helpful,
            },
            BulletTag {
                id,
                tag: TagKind::Harmful,
            },
            BulletTag {
                id: BulletId::new(42),
                tag: TagKind::Helpful,
            },
        ]);
        assert_eq!(applied, 2);
        let bullet = pb.get(id).unwrap();
        assert_eq!((bullet.helpful, bullet.harmful), (1, 1));
    }

    #[test]
    fn test_as_prompt_groups_by_section() {
        let mut pb = Playbook::new();
        pb.insert("strategies", "second", prov());
        pb.insert("apis", "first", prov());
        pb.insert("strategies", "third", prov());

        let text = pb.as_prompt();
        let apis = text.find("## apis").unwrap();
        let strategies = text.find("## strategies").unwrap();
        assert!(apis < strategies);
        assert!(text.contains("- [b-00001] second (helpful=0, harmful=0)"));
        assert!(text.find("second").unwrap() < text.find("third").unwrap());
        assert_eq!(Playbook::new().as_prompt(), "(the playbook is empty)");
    }

    #[test]
    fn test_merge_retires_absorbed_ids() {
        let mut pb = Playbook::new();
        let a = pb.insert("s", "a", prov());
        let b = pb.insert("s", "b", prov());
        pb.apply_tags(&[BulletTag {
            id: b,
            tag: TagKind::Helpful,
        }]);
        let candidates = pb.candidates(&[a, b].into_iter().collect());
        let plan = DedupPlan {
            keep: vec![a],
            merges: vec![Merge {
                into: a,
                absorbed: vec![b],
                content: None,
            }],
            remove: vec![],
        };

        let outcome = pb.apply_dedup_plan(&candidates, &plan).unwrap();
        assert_eq!(outcome.merged, vec![b]);
        assert!(!pb.contains(b));
        let survivor = pb.get(a).unwrap();
        assert_eq!(survivor.helpful, 1);
        assert_eq!(survivor.merged_from, vec![b]);

        let c = pb.insert("s", "c", prov());
        assert_ne!(c, b);
    }

    #[test]
    fn test_plan_referencing_non_candidate_is_rejected() {
        let mut pb = Playbook::new();
        let a = pb.insert("s", "a", prov());
        let outsider = pb.insert("s", "outsider", prov());
        let candidates = pb.candidates(&[a].into_iter().collect());
        let plan = DedupPlan {
            keep: vec![],
            merges: vec![],
            remove: vec![outsider],
        };
        let err = pb.apply_dedup_plan(&candidates, &plan).unwrap_err();
        assert!(matches!(err, PlaybookError::InvalidPlan(_)));
        assert!(pb.contains(outsider));
    }

    #[test]
    fn test_stale_plan_is_rejected() {
        let mut pb = Playbook::new();
        let a = pb.insert("s", "a", prov());
        let b = pb.insert("s", "b", prov());
        let candidates = pb.candidates(&[a, b].into_iter().collect());
        pb.apply_delta(
            &delta(vec![DeltaOperation::Update {
                bullet_id: b,
                content: "changed".into(),
            }]),
            &[],
            &prov(),
        )
        .unwrap();

        let plan = DedupPlan {
            keep: vec![a],
            merges: vec![],
            remove: vec![b],
        };
        let err = pb.apply_dedup_plan(&candidates, &plan).unwrap_err();
        assert_eq!(err, PlaybookError::Stale(b));
        assert_eq!(pb.len(), 2);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let mut pb = Playbook::new();
        pb.insert("apis", "Paginate.", prov());
        let gone = pb.insert("apis", "Retired.", prov());
        pb.apply_delta(&delta(vec![DeltaOperation::Remove { bullet_id: gone }]), &[], &prov())
            .unwrap();

        let tmp = std::env::temp_dir().join(format!("ace_playbook_{}.json", uuid::Uuid::new_v4()));
        pb.save_to_file(&tmp).unwrap();
        let loaded = Playbook::load_from_file(&tmp).unwrap();
        std::fs::remove_file(&tmp).ok();

        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.next_id(), BulletId::new(3));
        assert_eq!(loaded.get(BulletId::new(1)).unwrap().content, "Paginate.");
    }

    #[test]
    fn test_load_minimal_playbook_file() {
        let tmp = std::env::temp_dir().join(format!("ace_playbook_{}.json", uuid::Uuid::new_v4()));
        std::fs::write(
            &tmp,
            r#"{"bullets": [{"id": "b-00002", "content": "Check page_limit."}]}"#,
        )
        .unwrap();
        let loaded = Playbook::load_from_file(&tmp).unwrap();
        std::fs::remove_file(&tmp).ok();

        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.next_id(), BulletId::new(3));
    }
}
