use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use super::{PermissionLevel, PlayerData, PlayerId, StructureOwner};
use crate::world::TriggerPos;

/// Opaque structure identifier, assigned by the store on insert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StructureId(pub u64);

impl std::fmt::Display for StructureId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Kind of animated structure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StructureType {
    BigDoor,
    Drawbridge,
    Portcullis,
    SlidingDoor,
    Elevator,
    Flag,
    Windmill,
    RevolvingDoor,
    GarageDoor,
    Clock,
}

/// Axis-aligned block bounds, both corners inclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cuboid {
    pub min: [i32; 3],
    pub max: [i32; 3],
}

impl Cuboid {
    /// Build from any two opposite corners
    pub fn new(a: [i32; 3], b: [i32; 3]) -> Self {
        Self {
            min: [a[0].min(b[0]), a[1].min(b[1]), a[2].min(b[2])],
            max: [a[0].max(b[0]), a[1].max(b[1]), a[2].max(b[2])],
        }
    }

    pub fn volume(&self) -> u64 {
        (0..3)
            .map(|i| (self.max[i] as i64 - self.min[i] as i64 + 1) as u64)
            .product()
    }

    pub fn contains(&self, x: i32, y: i32, z: i32) -> bool {
        let p = [x, y, z];
        (0..3).all(|i| p[i] >= self.min[i] && p[i] <= self.max[i])
    }
}

/// A structure that has not been persisted yet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructureData {
    pub name: String,
    pub kind: StructureType,
    pub cuboid: Cuboid,
    pub rotation_point: [i32; 3],
    pub trigger: TriggerPos,
    pub is_open: bool,
    pub is_locked: bool,
    pub creator: PlayerData,
    /// Type-specific properties
    pub payload: serde_json::Value,
}

impl StructureData {
    pub fn new(
        name: impl Into<String>,
        kind: StructureType,
        cuboid: Cuboid,
        trigger: TriggerPos,
        creator: PlayerData,
    ) -> Self {
        let rotation_point = cuboid.min;
        Self {
            name: name.into(),
            kind,
            cuboid,
            rotation_point,
            trigger,
            is_open: false,
            is_locked: false,
            creator,
            payload: serde_json::Value::Null,
        }
    }
}

/// Mutable base flags of a live structure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructureState {
    pub is_open: bool,
    pub is_locked: bool,
}

/// Live, persisted structure.
///
/// Callers share it behind an `Arc`. Only the mutation pipeline changes the
/// owner set; it does so through the crate-private mutators below.
#[derive(Debug)]
pub struct Structure {
    id: StructureId,
    name: String,
    kind: StructureType,
    cuboid: Cuboid,
    rotation_point: [i32; 3],
    trigger: TriggerPos,
    payload: serde_json::Value,
    state: RwLock<StructureState>,
    owners: RwLock<FxHashMap<PlayerId, StructureOwner>>,
    valid: AtomicBool,
}

impl Structure {
    /// Materialise a freshly inserted record; its creator becomes the sole `Creator` owner
    pub fn new(id: StructureId, data: StructureData) -> Self {
        let mut owners = FxHashMap::default();
        owners.insert(
            data.creator.id,
            StructureOwner::new(id, data.creator, PermissionLevel::Creator),
        );
        Self {
            id,
            name: data.name,
            kind: data.kind,
            cuboid: data.cuboid,
            rotation_point: data.rotation_point,
            trigger: data.trigger,
            payload: data.payload,
            state: RwLock::new(StructureState {
                is_open: data.is_open,
                is_locked: data.is_locked,
            }),
            owners: RwLock::new(owners),
            valid: AtomicBool::new(true),
        }
    }

    /// Rebuild a live object from its persisted form
    pub fn from_snapshot(snapshot: &StructureSnapshot) -> Self {
        let owners = snapshot
            .owners
            .iter()
            .map(|owner| (owner.player.id, owner.clone()))
            .collect();
        Self {
            id: snapshot.id,
            name: snapshot.name.clone(),
            kind: snapshot.kind,
            cuboid: snapshot.cuboid,
            rotation_point: snapshot.rotation_point,
            trigger: snapshot.trigger.clone(),
            payload: snapshot.payload.clone(),
            state: RwLock::new(snapshot.state),
            owners: RwLock::new(owners),
            valid: AtomicBool::new(true),
        }
    }

    pub fn id(&self) -> StructureId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> StructureType {
        self.kind
    }

    pub fn cuboid(&self) -> Cuboid {
        self.cuboid
    }

    pub fn rotation_point(&self) -> [i32; 3] {
        self.rotation_point
    }

    pub fn trigger(&self) -> &TriggerPos {
        &self.trigger
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    pub fn state(&self) -> StructureState {
        *self.state.read()
    }

    pub fn set_open(&self, is_open: bool) {
        self.state.write().is_open = is_open;
    }

    pub fn set_locked(&self, is_locked: bool) {
        self.state.write().is_locked = is_locked;
    }

    pub fn owner(&self, player: PlayerId) -> Option<StructureOwner> {
        self.owners.read().get(&player).cloned()
    }

    /// Owners sorted by privilege, creator first
    pub fn owners(&self) -> Vec<StructureOwner> {
        let mut owners: Vec<_> = self.owners.read().values().cloned().collect();
        owners.sort_by(|a, b| a.level.cmp(&b.level).then(a.player.id.cmp(&b.player.id)));
        owners
    }

    pub fn creator(&self) -> Option<StructureOwner> {
        self.owners.read().values().find(|owner| owner.is_creator()).cloned()
    }

    pub fn owner_count(&self) -> usize {
        self.owners.read().len()
    }

    /// False once the structure has been deleted from the store
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub(crate) fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }

    /// Insert or replace an owner, returning the entry it displaced
    pub(crate) fn put_owner(&self, owner: StructureOwner) -> Option<StructureOwner> {
        self.owners.write().insert(owner.player.id, owner)
    }

    pub(crate) fn take_owner(&self, player: PlayerId) -> Option<StructureOwner> {
        self.owners.write().remove(&player)
    }

    /// Immutable copy of every persisted field
    pub fn snapshot(&self) -> StructureSnapshot {
        StructureSnapshot {
            id: self.id,
            name: self.name.clone(),
            kind: self.kind,
            cuboid: self.cuboid,
            rotation_point: self.rotation_point,
            trigger: self.trigger.clone(),
            payload: self.payload.clone(),
            state: self.state(),
            owners: self.owners(),
        }
    }
}

/// Point-in-time copy of a structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructureSnapshot {
    pub id: StructureId,
    pub name: String,
    pub kind: StructureType,
    pub cuboid: Cuboid,
    pub rotation_point: [i32; 3],
    pub trigger: TriggerPos,
    pub payload: serde_json::Value,
    pub state: StructureState,
    pub owners: Vec<StructureOwner>,
}

impl StructureSnapshot {
    pub fn creator(&self) -> Option<&StructureOwner> {
        self.owners.iter().find(|owner| owner.is_creator())
    }

    pub fn owner(&self, player: PlayerId) -> Option<&StructureOwner> {
        self.owners.iter().find(|owner| owner.player.id == player)
    }
}
