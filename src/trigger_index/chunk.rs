use rustc_hash::FxHashMap;

use crate::storage::ChunkTriggerMap;
use crate::structure::StructureId;

/// Every trigger inside one chunk.
///
/// Built in one piece from a store query and never patched afterwards; an
/// invalidated chunk is dropped and rebuilt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TriggerChunk {
    triggers: FxHashMap<i32, Vec<StructureId>>,
    all: Vec<StructureId>,
}

impl TriggerChunk {
    pub fn from_store(triggers: ChunkTriggerMap) -> Self {
        let mut all: Vec<StructureId> = triggers.values().flatten().copied().collect();
        all.sort_unstable();
        all.dedup();
        Self { triggers, all }
    }

    /// Structures whose trigger sits at the given local hash
    pub fn at(&self, local_hash: i32) -> &[StructureId] {
        self.triggers
            .get(&local_hash)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Every structure triggered somewhere in this chunk
    pub fn all(&self) -> &[StructureId] {
        &self.all
    }

    /// Number of distinct trigger locations
    pub fn trigger_count(&self) -> usize {
        self.triggers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.all.is_empty()
    }
}
