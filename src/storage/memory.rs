use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use super::{ChunkTriggerMap, StructureStore};
use crate::error::{store_failure, EngineResult};
use crate::structure::{
    PermissionLevel, PlayerData, PlayerId, Structure, StructureData, StructureId, StructureOwner,
    StructureSnapshot,
};
use crate::world::ChunkId;

/// Store entry points, used for call counting and fault injection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreMethod {
    Insert,
    RemoveById,
    AddOwner,
    RemoveOwner,
    TriggerIndexForChunk,
    HasStructuresInWorld,
    SyncBase,
    GetStructure,
    StructuresOwnedBy,
}

const ALL_METHODS: [StoreMethod; 9] = [
    StoreMethod::Insert,
    StoreMethod::RemoveById,
    StoreMethod::AddOwner,
    StoreMethod::RemoveOwner,
    StoreMethod::TriggerIndexForChunk,
    StoreMethod::HasStructuresInWorld,
    StoreMethod::SyncBase,
    StoreMethod::GetStructure,
    StoreMethod::StructuresOwnedBy,
];

/// Injected misbehaviour for one store method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreFault {
    /// Report failure through the normal return value
    Refuse,
    /// Return an adapter error
    Error,
    /// Panic inside the adapter
    Panic,
}

#[derive(Default)]
struct Tables {
    structures: BTreeMap<StructureId, StructureSnapshot>,
    next_id: u64,
}

/// In-process `StructureStore`.
///
/// Keeps persisted structures as snapshots. Counts calls per method and can
/// be told to slow down or misbehave, which is what the engine's tests lean on.
pub struct MemoryStore {
    tables: RwLock<Tables>,
    calls: FxHashMap<StoreMethod, AtomicU64>,
    faults: Mutex<FxHashMap<StoreMethod, StoreFault>>,
    latency_micros: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables {
                structures: BTreeMap::new(),
                next_id: 1,
            }),
            calls: ALL_METHODS.iter().map(|&m| (m, AtomicU64::new(0))).collect(),
            faults: Mutex::new(FxHashMap::default()),
            latency_micros: AtomicU64::new(0),
        }
    }

    /// Number of times `method` has been called
    pub fn calls(&self, method: StoreMethod) -> u64 {
        self.calls
            .get(&method)
            .map(|counter| counter.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub fn reset_calls(&self) {
        for counter in self.calls.values() {
            counter.store(0, Ordering::SeqCst);
        }
    }

    pub fn inject_fault(&self, method: StoreMethod, fault: StoreFault) {
        self.faults.lock().insert(method, fault);
    }

    pub fn clear_fault(&self, method: StoreMethod) {
        self.faults.lock().remove(&method);
    }

    /// Artificial delay applied to every call
    pub fn set_latency(&self, latency: Duration) {
        self.latency_micros
            .store(latency.as_micros() as u64, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.tables.read().structures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Persisted owner set of a structure, creator first
    pub fn owners_of(&self, id: StructureId) -> Option<Vec<StructureOwner>> {
        self.tables
            .read()
            .structures
            .get(&id)
            .map(|snapshot| snapshot.owners.clone())
    }

    /// Count the call, apply latency, then report any injected fault
    fn enter(&self, method: StoreMethod) -> Option<StoreFault> {
        if let Some(counter) = self.calls.get(&method) {
            counter.fetch_add(1, Ordering::SeqCst);
        }
        let latency = self.latency_micros.load(Ordering::SeqCst);
        if latency > 0 {
            std::thread::sleep(Duration::from_micros(latency));
        }
        let fault = self.faults.lock().get(&method).copied();
        match fault {
            Some(StoreFault::Panic) => panic!("injected panic in {:?}", method),
            other => other,
        }
    }
}

fn sort_owners(owners: &mut [StructureOwner]) {
    owners.sort_by(|a, b| a.level.cmp(&b.level).then(a.player.id.cmp(&b.player.id)));
}

impl StructureStore for MemoryStore {
    fn insert(&self, data: &StructureData) -> EngineResult<Option<Structure>> {
        match self.enter(StoreMethod::Insert) {
            Some(StoreFault::Refuse) => return Ok(None),
            Some(_) => return Err(store_failure("insert", "injected adapter error")),
            None => {}
        }

        let mut tables = self.tables.write();
        let id = StructureId(tables.next_id);
        tables.next_id += 1;

        let structure = Structure::new(id, data.clone());
        tables.structures.insert(id, structure.snapshot());
        log::trace!("MemoryStore: inserted structure {} ({})", id, data.name);
        Ok(Some(structure))
    }

    fn remove_by_id(&self, id: StructureId) -> EngineResult<bool> {
        match self.enter(StoreMethod::RemoveById) {
            Some(StoreFault::Refuse) => return Ok(false),
            Some(_) => return Err(store_failure("remove_by_id", "injected adapter error")),
            None => {}
        }
        Ok(self.tables.write().structures.remove(&id).is_some())
    }

    fn add_owner(
        &self,
        id: StructureId,
        player: &PlayerData,
        level: PermissionLevel,
    ) -> EngineResult<bool> {
        match self.enter(StoreMethod::AddOwner) {
            Some(StoreFault::Refuse) => return Ok(false),
            Some(_) => return Err(store_failure("add_owner", "injected adapter error")),
            None => {}
        }

        let mut tables = self.tables.write();
        let Some(snapshot) = tables.structures.get_mut(&id) else {
            return Ok(false);
        };
        if level == PermissionLevel::Creator {
            return Ok(false);
        }
        if let Some(existing) = snapshot.owners.iter_mut().find(|o| o.player.id == player.id) {
            if existing.is_creator() {
                return Ok(false);
            }
            existing.level = level;
            existing.player = player.clone();
        } else {
            snapshot
                .owners
                .push(StructureOwner::new(id, player.clone(), level));
        }
        sort_owners(&mut snapshot.owners);
        Ok(true)
    }

    fn remove_owner(&self, id: StructureId, player: PlayerId) -> EngineResult<bool> {
        match self.enter(StoreMethod::RemoveOwner) {
            Some(StoreFault::Refuse) => return Ok(false),
            Some(_) => return Err(store_failure("remove_owner", "injected adapter error")),
            None => {}
        }

        let mut tables = self.tables.write();
        let Some(snapshot) = tables.structures.get_mut(&id) else {
            return Ok(false);
        };
        let before = snapshot.owners.len();
        snapshot
            .owners
            .retain(|owner| owner.player.id != player || owner.is_creator());
        Ok(snapshot.owners.len() < before)
    }

    fn trigger_index_for_chunk(&self, world: &str, chunk: ChunkId) -> EngineResult<ChunkTriggerMap> {
        if self.enter(StoreMethod::TriggerIndexForChunk).is_some() {
            return Err(store_failure(
                "trigger_index_for_chunk",
                "injected adapter error",
            ));
        }

        let tables = self.tables.read();
        let mut index = ChunkTriggerMap::default();
        for snapshot in tables.structures.values() {
            let trigger = &snapshot.trigger;
            if trigger.world == world && trigger.chunk_id() == chunk {
                index
                    .entry(trigger.local_hash())
                    .or_insert_with(Vec::new)
                    .push(snapshot.id);
            }
        }
        Ok(index)
    }

    fn has_structures_in_world(&self, world: &str) -> EngineResult<bool> {
        if self.enter(StoreMethod::HasStructuresInWorld).is_some() {
            return Err(store_failure(
                "has_structures_in_world",
                "injected adapter error",
            ));
        }
        Ok(self
            .tables
            .read()
            .structures
            .values()
            .any(|snapshot| snapshot.trigger.world == world))
    }

    fn sync_base(&self, snapshot: &StructureSnapshot) -> EngineResult<bool> {
        match self.enter(StoreMethod::SyncBase) {
            Some(StoreFault::Refuse) => return Ok(false),
            Some(_) => return Err(store_failure("sync_base", "injected adapter error")),
            None => {}
        }

        let mut tables = self.tables.write();
        match tables.structures.get_mut(&snapshot.id) {
            Some(stored) => {
                stored.state = snapshot.state;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn get_structure(&self, id: StructureId) -> EngineResult<Option<StructureSnapshot>> {
        match self.enter(StoreMethod::GetStructure) {
            Some(StoreFault::Refuse) => return Ok(None),
            Some(_) => return Err(store_failure("get_structure", "injected adapter error")),
            None => {}
        }
        Ok(self.tables.read().structures.get(&id).cloned())
    }

    fn structures_owned_by(&self, player: PlayerId) -> EngineResult<Vec<StructureId>> {
        match self.enter(StoreMethod::StructuresOwnedBy) {
            Some(StoreFault::Refuse) => return Ok(Vec::new()),
            Some(_) => {
                return Err(store_failure(
                    "structures_owned_by",
                    "injected adapter error",
                ))
            }
            None => {}
        }
        Ok(self
            .tables
            .read()
            .structures
            .values()
            .filter(|snapshot| snapshot.owner(player).is_some())
            .map(|snapshot| snapshot.id)
            .collect())
    }
}
