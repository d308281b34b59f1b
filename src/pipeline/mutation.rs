use crate::error::EngineError;
use crate::structure::{PlayerId, Structure, StructureOwner};

use super::ActionResult;

/// In-memory change that is applied before it is persisted.
///
/// `compensate` must put the structure back exactly as `apply` found it.
pub trait OptimisticMutation {
    /// Change the live structure. Returns false when there was nothing to change.
    fn apply(&mut self, structure: &Structure) -> bool;

    /// Undo a successful `apply`
    fn compensate(&mut self, structure: &Structure);

    fn describe(&self) -> String;
}

/// Grants (or changes) one owner's level
#[derive(Debug)]
pub struct AddOwnerMutation {
    owner: StructureOwner,
    displaced: Option<StructureOwner>,
}

impl AddOwnerMutation {
    pub fn new(owner: StructureOwner) -> Self {
        Self {
            owner,
            displaced: None,
        }
    }
}

impl OptimisticMutation for AddOwnerMutation {
    fn apply(&mut self, structure: &Structure) -> bool {
        self.displaced = structure.put_owner(self.owner.clone());
        true
    }

    fn compensate(&mut self, structure: &Structure) {
        match self.displaced.take() {
            Some(previous) => {
                structure.put_owner(previous);
            }
            None => {
                structure.take_owner(self.owner.player.id);
            }
        }
    }

    fn describe(&self) -> String {
        format!("add owner {} as {:?}", self.owner.player, self.owner.level)
    }
}

/// Revokes one owner
#[derive(Debug)]
pub struct RemoveOwnerMutation {
    player: PlayerId,
    removed: Option<StructureOwner>,
}

impl RemoveOwnerMutation {
    pub fn new(player: PlayerId) -> Self {
        Self {
            player,
            removed: None,
        }
    }
}

impl OptimisticMutation for RemoveOwnerMutation {
    fn apply(&mut self, structure: &Structure) -> bool {
        self.removed = structure.take_owner(self.player);
        self.removed.is_some()
    }

    fn compensate(&mut self, structure: &Structure) {
        if let Some(owner) = self.removed.take() {
            structure.put_owner(owner);
        }
    }

    fn describe(&self) -> String {
        format!("remove owner {}", self.player)
    }
}

/// Apply `mutation`, persist it, and compensate if persisting fails
pub fn run_optimistic<M, P>(structure: &Structure, mutation: &mut M, persist: P) -> ActionResult
where
    M: OptimisticMutation + ?Sized,
    P: FnOnce() -> bool,
{
    if !mutation.apply(structure) {
        log::debug!(
            "Nothing to {} on structure {}",
            mutation.describe(),
            structure.id()
        );
        return ActionResult::Fail;
    }

    if persist() {
        return ActionResult::Success;
    }

    mutation.compensate(structure);
    let violation = EngineError::ConsistencyViolation {
        structure: structure.id(),
        attempted: mutation.describe(),
        reverted: describe_owners(&structure.owners()),
    };
    log::error!("{}", violation);
    ActionResult::Fail
}

fn describe_owners(owners: &[StructureOwner]) -> String {
    let entries: Vec<String> = owners
        .iter()
        .map(|owner| format!("{}={:?}", owner.player.name, owner.level))
        .collect();
    format!("owners [{}]", entries.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structure::{
        Cuboid, PermissionLevel, PlayerData, StructureData, StructureId, StructureType,
    };
    use crate::world::TriggerPos;

    fn structure() -> Structure {
        Structure::new(
            StructureId(3),
            StructureData::new(
                "bridge",
                StructureType::Drawbridge,
                Cuboid::new([0, 60, 0], [4, 60, 8]),
                TriggerPos::new("alpha", 2, 61, 0),
                PlayerData::new(1, "alice"),
            ),
        )
    }

    fn owner(id: u128, name: &str, level: PermissionLevel) -> StructureOwner {
        StructureOwner::new(StructureId(3), PlayerData::new(id, name), level)
    }

    #[test]
    fn test_add_owner_persisted() {
        let structure = structure();
        let mut mutation = AddOwnerMutation::new(owner(2, "bob", PermissionLevel::User));
        let result = run_optimistic(&structure, &mut mutation, || true);
        assert_eq!(result, ActionResult::Success);
        assert_eq!(structure.owner_count(), 2);
    }

    #[test]
    fn test_add_owner_rollback_removes_new_owner() {
        let structure = structure();
        let before = structure.owners();
        let mut mutation = AddOwnerMutation::new(owner(2, "bob", PermissionLevel::Admin));
        assert_eq!(run_optimistic(&structure, &mut mutation, || false), ActionResult::Fail);
        assert_eq!(structure.owners(), before);
    }

    #[test]
    fn test_add_owner_rollback_restores_previous_level() {
        let structure = structure();
        structure.put_owner(owner(2, "bob", PermissionLevel::User));
        let before = structure.owners();

        let mut mutation = AddOwnerMutation::new(owner(2, "bob", PermissionLevel::Admin));
        assert_eq!(run_optimistic(&structure, &mut mutation, || false), ActionResult::Fail);
        assert_eq!(structure.owners(), before);
        assert_eq!(
            structure.owner(PlayerId(2)).map(|o| o.level),
            Some(PermissionLevel::User)
        );
    }

    #[test]
    fn test_remove_owner_rollback_reinstates_owner() {
        let structure = structure();
        structure.put_owner(owner(2, "bob", PermissionLevel::Admin));
        let before = structure.owners();

        let mut mutation = RemoveOwnerMutation::new(PlayerId(2));
        assert_eq!(run_optimistic(&structure, &mut mutation, || false), ActionResult::Fail);
        assert_eq!(structure.owners(), before);
    }

    #[test]
    fn test_remove_missing_owner_skips_persist() {
        let structure = structure();
        let mut persisted = false;
        let mut mutation = RemoveOwnerMutation::new(PlayerId(42));
        let result = run_optimistic(&structure, &mut mutation, || {
            persisted = true;
            true
        });
        assert_eq!(result, ActionResult::Fail);
        assert!(!persisted);
    }
}
