//! Structure records
//!
//! `StructureData` is what a caller proposes, `Structure` is the live record
//! shared behind an `Arc`, and `StructureSnapshot` is the immutable copy used
//! whenever a removal or notification must not race the live object.

mod owner;
mod record;

pub use owner::{PermissionLevel, PlayerData, PlayerId, StructureOwner};
pub use record::{
    Cuboid, Structure, StructureData, StructureId, StructureSnapshot, StructureState,
    StructureType,
};
