//! The playbook: the knowledge store carried across samples.
//!
//! 1. **Types** ([`types`]) -- bullets, identifiers, reflector tags and
//!    curator deltas.
//! 2. **Library** ([`library`]) -- the ordered [`Playbook`] with validated
//!    batch writes and JSON persistence.
//! 3. **Shared** ([`shared`]) -- [`SharedPlaybook`], the lock-guarded handle
//!    the adapters pass around.
//! 4. **Window** ([`window`]) -- the bounded [`ReflectionWindow`].
//! 5. **Dedup** ([`dedup`]) -- the [`Deduplicator`] capability and its
//!    embedding and lexical implementations.

pub mod dedup;
pub mod library;
pub mod shared;
pub mod types;
pub mod window;

pub use dedup::{
    cosine_similarity, AnyDeduplicator, DedupPlan, Deduplicator, EmbeddingDeduplicator,
    LexicalDeduplicator, Merge,
};
pub use library::{DedupOutcome, Playbook};
pub use shared::SharedPlaybook;
pub use types::{Bullet, BulletId, BulletTag, CuratorDelta, DeltaOperation, Provenance, TagKind};
pub use window::ReflectionWindow;
