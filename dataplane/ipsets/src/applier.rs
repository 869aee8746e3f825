use crate::error::ApplyError;
use npm_dataplane_core::{SetKind, SetMetadata, SetType};

/// A platform dataplane able to realize one batch of pending changes and to
/// clear all agent-owned kernel state.
///
/// Implementations are handed an owned snapshot built under the manager's
/// lock, so they never reach back into the manager. A successful `apply`
/// means every change in the batch is in the kernel (possibly after internal
/// retries); a failure means the caller should keep its pending state and
/// try again later.
pub trait Applier {
    fn apply(&self, batch: &ApplyBatch) -> Result<(), ApplyError>;
    fn reset(&self) -> Result<(), ApplyError>;
}

/// One apply's worth of pending changes, rendered from the dirty cache.
/// Entries are sorted by name so renders are deterministic.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ApplyBatch {
    pub to_add_or_update: Vec<SetDelta>,
    pub to_destroy: Vec<DestroyDelta>,
}

/// The pending changes for one live set.
#[derive(Clone, Debug, PartialEq)]
pub struct SetDelta {
    pub name: String,
    pub hashed_name: String,
    pub set_type: SetType,
    pub kind: SetKind,

    /// True when the set is not yet in the kernel and must be created there.
    pub create: bool,

    /// Kernel member keys pending addition/removal since the last apply.
    pub members_to_add: Vec<String>,
    pub members_to_delete: Vec<String>,

    /// The full desired kernel membership. Appliers that write whole objects
    /// (Windows) or reconcile against observed kernel state (Linux) use this
    /// instead of the diffs.
    pub desired_members: Vec<String>,
}

/// A set pending kernel destruction. The entity is gone from the manager's
/// map, so this carries everything the applier needs.
#[derive(Clone, Debug, PartialEq)]
pub struct DestroyDelta {
    pub name: String,
    pub hashed_name: String,
}

// === impl ApplyBatch ===

impl ApplyBatch {
    pub fn is_empty(&self) -> bool {
        self.to_add_or_update.is_empty() && self.to_destroy.is_empty()
    }
}

// === impl DestroyDelta ===

impl DestroyDelta {
    /// Recovers the set kind from the name prefix; the entity itself no
    /// longer exists. Unrecognized names are treated as hash sets.
    pub fn kind(&self) -> SetKind {
        SetMetadata::from_prefixed_name(&self.name)
            .map(|md| md.kind())
            .unwrap_or(SetKind::Hash)
    }
}
