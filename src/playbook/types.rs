//! Core playbook data types.
//!
//! A **bullet** is one strategy note in the playbook: a short piece of advice
//! distilled by the curator from a reflection on a finished trajectory. Bullet
//! identifiers are allocated by the playbook, are stable for the bullet's
//! lifetime and are never handed out again once retired.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Stable identifier of a bullet, rendered as `b-00042`.
///
/// Identifiers are allocated from a monotonically increasing counter, so
/// ordering by identifier is the same as ordering by insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BulletId(u64);

impl BulletId {
    pub fn new(seq: u64) -> Self {
        Self(seq)
    }

    /// The allocation sequence number.
    pub fn seq(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for BulletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "b-{:05}", self.0)
    }
}

impl FromStr for BulletId {
    type Err = String;

    /// Accepts `b-00042`, `B-42` and a bare `42`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_start_matches('[').trim_end_matches(']');
        let digits = trimmed
            .strip_prefix("b-")
            .or_else(|| trimmed.strip_prefix("B-"))
            .unwrap_or(trimmed);
        digits
            .parse::<u64>()
            .map(Self)
            .map_err(|_| format!("not a bullet id: {s:?}"))
    }
}

impl TryFrom<String> for BulletId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BulletId> for String {
    fn from(id: BulletId) -> Self {
        id.to_string()
    }
}

// ---------------------------------------------------------------------------
// Bullets
// ---------------------------------------------------------------------------

/// Where a bullet came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    /// Task whose reflection/curation produced the bullet.
    pub task_id: String,
    /// Offline epoch (1-based), or `None` for online runs.
    #[serde(default)]
    pub epoch: Option<usize>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Default for Provenance {
    fn default() -> Self {
        Self::new("unknown", None)
    }
}

impl Provenance {
    pub fn new(task_id: impl Into<String>, epoch: Option<usize>) -> Self {
        Self {
            task_id: task_id.into(),
            epoch,
            created_at: Utc::now(),
        }
    }
}

/// A single playbook entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bullet {
    pub id: BulletId,
    /// Section label used to group bullets in prompt text (e.g. `strategies`).
    #[serde(default = "default_section")]
    pub section: String,
    pub content: String,
    #[serde(default)]
    pub provenance: Provenance,
    /// Times the reflector marked this bullet as helpful.
    #[serde(default)]
    pub helpful: u32,
    /// Times the reflector marked this bullet as harmful.
    #[serde(default)]
    pub harmful: u32,
    /// Identifiers absorbed into this bullet by deduplication merges.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub merged_from: Vec<BulletId>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

pub(crate) fn default_section() -> String {
    "general".to_string()
}

impl Bullet {
    /// One-line rendering used in prompts: `- [b-00001] content (helpful=2, harmful=0)`.
    pub fn to_prompt_line(&self) -> String {
        format!(
            "- [{}] {} (helpful={}, harmful={})",
            self.id, self.content, self.helpful, self.harmful
        )
    }
}

// ---------------------------------------------------------------------------
// Reflector tags
// ---------------------------------------------------------------------------

/// How a reflection judged a bullet the generator relied on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagKind {
    Helpful,
    Harmful,
    Neutral,
}

/// A reflector verdict on one bullet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulletTag {
    pub id: BulletId,
    pub tag: TagKind,
}

// ---------------------------------------------------------------------------
// Curator deltas
// ---------------------------------------------------------------------------

/// A single mutation proposed by the curator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum DeltaOperation {
    /// Insert a new bullet; the playbook assigns its identifier.
    Add {
        #[serde(default = "default_section")]
        section: String,
        content: String,
    },
    /// Replace the content of a live bullet.
    Update { bullet_id: BulletId, content: String },
    /// Retire a live bullet.
    Remove { bullet_id: BulletId },
}

/// The curator's full proposal for one sample.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CuratorDelta {
    #[serde(default)]
    pub reasoning: String,
    pub operations: Vec<DeltaOperation>,
}

impl CuratorDelta {
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bullet_id_display_and_parse() {
        let id = BulletId::new(42);
        assert_eq!(id.to_string(), "b-00042");
        assert_eq!("b-00042".parse::<BulletId>().unwrap(), id);
        assert_eq!("[b-00042]".parse::<BulletId>().unwrap(), id);
        assert_eq!("42".parse::<BulletId>().unwrap(), id);
        assert!("strategy-1".parse::<BulletId>().is_err());
    }

    #[test]
    fn minimal_bullet_parses_with_defaults() {
        let bullet: Bullet =
            serde_json::from_str(r#"{"id": "b-00007", "content": "Paginate."}"#).unwrap();
        assert_eq!(bullet.id, BulletId::new(7));
        assert_eq!(bullet.section, "general");
        assert_eq!(bullet.provenance.task_id, "unknown");
        assert_eq!((bullet.helpful, bullet.harmful), (0, 0));
    }

    #[test]
    fn bullet_ids_order_by_allocation() {
        assert!(BulletId::new(2) < BulletId::new(10));
    }

    #[test]
    fn delta_operations_parse_from_tagged_json() {
        let json = r#"{
            "reasoning": "consolidate pagination advice",
            "operations": [
                {"type": "ADD", "section": "apis", "content": "Page through results until empty."},
                {"type": "UPDATE", "bullet_id": "b-00003", "content": "Check page_limit first."},
                {"type": "REMOVE", "bullet_id": "b-00004"}
            ]
        }"#;
        let delta: CuratorDelta = serde_json::from_str(json).unwrap();

        assert_eq!(delta.operations.len(), 3);
        assert_eq!(
            delta.operations[1],
            DeltaOperation::Update {
                bullet_id: BulletId::new(3),
                content: "Check page_limit first.".into(),
            }
        );
        assert_eq!(
            delta.operations[2],
            DeltaOperation::Remove {
                bullet_id: BulletId::new(4)
            }
        );
    }

    #[test]
    fn add_without_section_uses_default() {
        let op: DeltaOperation =
            serde_json::from_str(r#"{"type": "ADD", "content": "x"}"#).unwrap();
        assert_eq!(
            op,
            DeltaOperation::Add {
                section: "general".into(),
                content: "x".into()
            }
        );
    }
}
