//! Abstract storage interface
//!
//! The engine never talks to a database directly. Everything it persists or
//! reads goes through `StructureStore`. Implementations block on their own I/O;
//! the engine only calls them from its storage worker pool.
//!
//! Return conventions: `Ok(false)` / `Ok(None)` mean the store could not
//! complete the request (row missing, constraint violated). `Err` means the
//! adapter itself broke; callers log it with full context and treat it the
//! same as a refusal.

mod memory;

pub use memory::{MemoryStore, StoreFault, StoreMethod};

use std::panic::{catch_unwind, AssertUnwindSafe};

use rustc_hash::FxHashMap;

use crate::error::{panic_message, store_failure, EngineResult};
use crate::structure::{
    PermissionLevel, PlayerData, PlayerId, Structure, StructureData, StructureId,
    StructureSnapshot,
};
use crate::world::ChunkId;

/// Trigger locations inside one chunk: local hash to the structures triggered there
pub type ChunkTriggerMap = FxHashMap<i32, Vec<StructureId>>;

pub trait StructureStore: Send + Sync {
    /// Persist a new structure. The returned record carries its assigned id.
    fn insert(&self, data: &StructureData) -> EngineResult<Option<Structure>>;

    fn remove_by_id(&self, id: StructureId) -> EngineResult<bool>;

    fn add_owner(
        &self,
        id: StructureId,
        player: &PlayerData,
        level: PermissionLevel,
    ) -> EngineResult<bool>;

    fn remove_owner(&self, id: StructureId, player: PlayerId) -> EngineResult<bool>;

    fn trigger_index_for_chunk(&self, world: &str, chunk: ChunkId) -> EngineResult<ChunkTriggerMap>;

    fn has_structures_in_world(&self, world: &str) -> EngineResult<bool>;

    /// Persist the mutable base flags (open, locked)
    fn sync_base(&self, snapshot: &StructureSnapshot) -> EngineResult<bool>;

    fn get_structure(&self, id: StructureId) -> EngineResult<Option<StructureSnapshot>>;

    fn structures_owned_by(&self, player: PlayerId) -> EngineResult<Vec<StructureId>>;
}

/// Run one store call, turning a panicking adapter into a `StoreFailure`
pub(crate) fn guarded<T, F>(operation: &str, call: F) -> EngineResult<T>
where
    F: FnOnce() -> EngineResult<T>,
{
    match catch_unwind(AssertUnwindSafe(call)) {
        Ok(result) => result,
        Err(payload) => Err(store_failure(
            operation,
            format!("adapter panicked: {}", panic_message(payload.as_ref())),
        )),
    }
}
