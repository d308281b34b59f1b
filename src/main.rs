/// Structure engine demo
///
/// Runs a create, query, add owner, delete, query round trip against the
/// in-memory store. Pass a TOML config path as the first argument to
/// override the defaults.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use structure_engine::{
    ActionResult, Cuboid, EngineConfig, EventBus, MemoryStore, PermissionLevel, PlayerData,
    StructureData, StructureEngine, StructureType, TriggerPos,
};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => EngineConfig::load(&path)
            .with_context(|| format!("Failed to load config from {}", path))?,
        None => EngineConfig::default(),
    };

    let engine = StructureEngine::start(
        config,
        Arc::new(MemoryStore::new()),
        Arc::new(EventBus::new()),
    )?;
    let index = engine.trigger_index();
    let manager = engine.manager();
    index.load_world("overworld");

    let alice = PlayerData::new(0x0a11ce, "alice");
    let bob = PlayerData::new(0x0b0b, "bob");

    let data = StructureData::new(
        "front gate",
        StructureType::BigDoor,
        Cuboid::new([4, 64, 4], [6, 68, 4]),
        TriggerPos::new("overworld", 5, 64, 5),
        alice.clone(),
    );
    let created = manager.create(data, Some(alice.clone())).wait();
    let Some(gate) = created.structure else {
        bail!("Structure creation failed (cancelled: {})", created.cancelled);
    };
    log::info!("Created {} with id {}", gate.name(), gate.id());

    let found = index.structures_at_trigger("overworld", 5, 64, 5).wait()?;
    log::info!("Structures triggered at (5, 64, 5): {:?}", found);

    let granted = manager
        .add_owner(&gate, bob.clone(), PermissionLevel::User, Some(alice.clone()))
        .wait();
    log::info!("Adding {} as user: {:?}", bob, granted);
    for owner in gate.owners() {
        log::info!("  owner {} at {:?}", owner.player, owner.level);
    }

    let refused = manager.remove_owner(&gate, alice.id, None).wait();
    log::info!("Removing the creator: {:?}", refused);

    let deleted = manager.delete(&gate, Some(alice)).wait();
    if deleted != ActionResult::Success {
        bail!("Failed to delete {}: {:?}", gate.id(), deleted);
    }
    let remaining = index.structures_at_trigger("overworld", 5, 64, 5).wait()?;
    log::info!("Structures triggered at (5, 64, 5) after delete: {:?}", remaining);

    engine.shutdown();
    Ok(())
}
