use serde::{Deserialize, Serialize};

use super::StructureId;

/// Unique player identifier (a UUID in its integer form)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlayerId(pub u128);

impl std::fmt::Display for PlayerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// Identity of a player as the store records it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlayerData {
    pub id: PlayerId,
    pub name: String,
}

impl PlayerData {
    pub fn new(id: u128, name: impl Into<String>) -> Self {
        Self {
            id: PlayerId(id),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for PlayerData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

/// Ownership tier. A lower value means more privilege.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PermissionLevel {
    Creator = 0,
    Admin = 100,
    User = 200,
    NoPermission = 999,
}

impl PermissionLevel {
    pub fn value(self) -> i32 {
        self as i32
    }

    pub fn from_value(value: i32) -> Option<Self> {
        match value {
            0 => Some(PermissionLevel::Creator),
            100 => Some(PermissionLevel::Admin),
            200 => Some(PermissionLevel::User),
            999 => Some(PermissionLevel::NoPermission),
            _ => None,
        }
    }

    /// Whether this level carries at least the privilege of `other`
    pub fn at_least(self, other: PermissionLevel) -> bool {
        self.value() <= other.value()
    }

    /// Levels that can be handed out through the add-owner operation
    pub fn is_grantable(self) -> bool {
        self != PermissionLevel::NoPermission && self.value() > 0
    }
}

/// One entry of a structure's owner set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructureOwner {
    pub structure: StructureId,
    pub player: PlayerData,
    pub level: PermissionLevel,
}

impl StructureOwner {
    pub fn new(structure: StructureId, player: PlayerData, level: PermissionLevel) -> Self {
        Self {
            structure,
            player,
            level,
        }
    }

    pub fn is_creator(&self) -> bool {
        self.level == PermissionLevel::Creator
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_ordering() {
        assert!(PermissionLevel::Creator < PermissionLevel::Admin);
        assert!(PermissionLevel::Creator.at_least(PermissionLevel::User));
        assert!(!PermissionLevel::User.at_least(PermissionLevel::Admin));
    }

    #[test]
    fn test_grantable_levels() {
        assert!(!PermissionLevel::Creator.is_grantable());
        assert!(!PermissionLevel::NoPermission.is_grantable());
        assert!(PermissionLevel::Admin.is_grantable());
        assert!(PermissionLevel::User.is_grantable());
    }

    #[test]
    fn test_from_value() {
        for level in [
            PermissionLevel::Creator,
            PermissionLevel::Admin,
            PermissionLevel::User,
            PermissionLevel::NoPermission,
        ] {
            assert_eq!(PermissionLevel::from_value(level.value()), Some(level));
        }
        assert_eq!(PermissionLevel::from_value(-1), None);
    }
}
