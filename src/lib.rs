pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod event_system;
pub mod listeners;
pub mod pipeline;
pub mod storage;
pub mod structure;
pub mod thread_pool;
pub mod trigger_index;
pub mod world;

pub use cache::{CacheStats, CacheSweeper, ExpiringCache};
pub use config::{CachePolicy, EngineConfig};
pub use engine::StructureEngine;
pub use error::{EngineError, EngineResult};
pub use event_system::{
    CancellableEvent, EventBus, EventHandler, EventPriority, NotificationEvent, PrepareAction,
    StructureEventBus,
};
pub use listeners::{ListenerRegistry, StructureListener};
pub use pipeline::{ActionResult, CreationResult, PendingAction, StructureManager};
pub use storage::{MemoryStore, StructureStore};
pub use structure::{
    Cuboid, PermissionLevel, PlayerData, PlayerId, Structure, StructureData, StructureId,
    StructureOwner, StructureSnapshot, StructureType,
};
pub use thread_pool::{PoolCategory, TaskHandle, ThreadPoolManager};
pub use trigger_index::{TriggerChunk, TriggerIndex};
pub use world::{ChunkId, TriggerPos};
