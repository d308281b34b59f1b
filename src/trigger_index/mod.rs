/// Spatial Trigger Index
///
/// Answers "which structures are triggered here?" without a store round trip
/// per query. Each loaded world keeps:
/// - A chunk cache: `ChunkId` to `TriggerChunk`, built lazily from the store
/// - A "has structures" flag that short-circuits queries for empty worlds
///
/// Both are `ExpiringCache`s, so concurrent misses on one chunk collapse into
/// a single store query. The index listens for structure creation and
/// deletion and drops the affected chunk when either happens.

mod chunk;

pub use chunk::TriggerChunk;

use std::sync::Arc;

use dashmap::DashMap;

use crate::cache::{CacheStats, CacheSweeper, ExpiringCache};
use crate::config::CachePolicy;
use crate::error::{EngineError, EngineResult};
use crate::listeners::StructureListener;
use crate::storage::{guarded, StructureStore};
use crate::structure::{StructureId, StructureSnapshot};
use crate::thread_pool::{PoolCategory, TaskHandle, ThreadPoolManager};
use crate::world::{local_hash, ChunkId, TriggerPos};

/// Cache partition of one loaded world
struct WorldTriggers {
    chunks: Arc<ExpiringCache<ChunkId, Arc<TriggerChunk>>>,
    has_structures: Arc<ExpiringCache<(), bool>>,
}

struct IndexInner {
    store: Arc<dyn StructureStore>,
    pools: Arc<ThreadPoolManager>,
    sweeper: Arc<CacheSweeper>,
    worlds: DashMap<String, Arc<WorldTriggers>>,
    chunk_policy: CachePolicy,
    flag_policy: CachePolicy,
}

/// Per-world, per-chunk index of trigger locations
#[derive(Clone)]
pub struct TriggerIndex {
    inner: Arc<IndexInner>,
}

impl TriggerIndex {
    pub fn new(
        store: Arc<dyn StructureStore>,
        pools: Arc<ThreadPoolManager>,
        sweeper: Arc<CacheSweeper>,
        chunk_policy: CachePolicy,
        flag_policy: CachePolicy,
    ) -> Self {
        Self {
            inner: Arc::new(IndexInner {
                store,
                pools,
                sweeper,
                worlds: DashMap::new(),
                chunk_policy,
                flag_policy,
            }),
        }
    }

    /// Start indexing a world. Returns false if it was already loaded.
    pub fn load_world(&self, world: &str) -> bool {
        let mut created = false;
        self.inner.worlds.entry(world.to_string()).or_insert_with(|| {
            created = true;
            let partition = WorldTriggers {
                chunks: Arc::new(ExpiringCache::new(
                    format!("trigger-chunks[{}]", world),
                    self.inner.chunk_policy,
                )),
                has_structures: Arc::new(ExpiringCache::new(
                    format!("world-flag[{}]", world),
                    self.inner.flag_policy,
                )),
            };
            if self.inner.chunk_policy.is_enabled() {
                self.inner.sweeper.register(&partition.chunks);
            }
            if self.inner.flag_policy.is_enabled() {
                self.inner.sweeper.register(&partition.has_structures);
            }
            Arc::new(partition)
        });

        if created {
            log::info!("Loaded trigger index for world {}", world);
        }
        created
    }

    /// Drop a world's partition along with everything cached for it
    pub fn unload_world(&self, world: &str) -> bool {
        match self.inner.worlds.remove(world) {
            Some(_) => {
                log::info!("Unloaded trigger index for world {}", world);
                true
            }
            None => false,
        }
    }

    pub fn unload_all(&self) {
        let count = self.inner.worlds.len();
        self.inner.worlds.clear();
        log::debug!("Unloaded {} trigger index partitions", count);
    }

    /// Names of loaded worlds, sorted
    pub fn loaded_worlds(&self) -> Vec<String> {
        let mut worlds: Vec<String> = self
            .inner
            .worlds
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        worlds.sort();
        worlds
    }

    pub fn is_loaded(&self, world: &str) -> bool {
        self.inner.worlds.contains_key(world)
    }

    /// Chunks currently cached for `world`
    pub fn cached_chunk_count(&self, world: &str) -> usize {
        self.inner
            .worlds
            .get(world)
            .map_or(0, |partition| partition.chunks.len())
    }

    pub fn chunk_cache_stats(&self, world: &str) -> Option<CacheStats> {
        self.inner
            .worlds
            .get(world)
            .map(|partition| partition.chunks.stats())
    }

    /// Structures whose trigger block is exactly at (x, y, z)
    pub fn structures_at_trigger(
        &self,
        world: &str,
        x: i32,
        y: i32,
        z: i32,
    ) -> TaskHandle<Vec<StructureId>> {
        let inner = Arc::clone(&self.inner);
        let world = world.to_string();
        self.inner
            .pools
            .spawn(PoolCategory::Storage, "structures_at_trigger", move || {
                inner
                    .at_trigger(&world, x, y, z)
                    .unwrap_or_else(|e| inner.query_failed("structures_at_trigger", &world, e))
            })
    }

    /// Every structure triggered inside the chunk holding block (x, z)
    pub fn structures_in_chunk(&self, world: &str, x: i32, z: i32) -> TaskHandle<Vec<StructureId>> {
        let inner = Arc::clone(&self.inner);
        let world = world.to_string();
        self.inner
            .pools
            .spawn(PoolCategory::Storage, "structures_in_chunk", move || {
                inner
                    .in_chunk(&world, x, z)
                    .unwrap_or_else(|e| inner.query_failed("structures_in_chunk", &world, e))
            })
    }

    /// Whether the world has at least one structure, as last seen in the store
    pub fn is_structure_world(&self, world: &str) -> TaskHandle<bool> {
        let inner = Arc::clone(&self.inner);
        let world = world.to_string();
        self.inner
            .pools
            .spawn(PoolCategory::Storage, "is_structure_world", move || {
                inner
                    .partition(&world)
                    .and_then(|partition| inner.has_structures(&world, &partition))
                    .unwrap_or_else(|e| {
                        inner.query_failed("is_structure_world", &world, e);
                        false
                    })
            })
    }

    /// Forget the chunk holding (x, y, z) and re-check the world flag.
    ///
    /// The chunk is dropped before this returns; only the flag re-check runs
    /// on the worker pool.
    pub fn invalidate(&self, world: &str, x: i32, y: i32, z: i32) -> TaskHandle<()> {
        let chunk = ChunkId::from_block(x, z);
        if !self.inner.evict_chunk(world, chunk) {
            return TaskHandle::ready("invalidate", ());
        }
        log::trace!("Invalidated chunk {} for trigger {}@({}, {}, {})", chunk, world, x, y, z);
        self.spawn_flag_refresh(world)
    }

    /// A structure's trigger moved from `old` to `new`
    pub fn move_trigger(&self, old: &TriggerPos, new: &TriggerPos) -> TaskHandle<()> {
        let old_loaded = self.inner.evict_chunk(&old.world, old.chunk_id());
        let new_loaded = self.inner.evict_chunk(&new.world, new.chunk_id());
        log::debug!("Trigger moved from {} to {}", old, new);

        if old.world == new.world {
            return if old_loaded {
                self.spawn_flag_refresh(&old.world)
            } else {
                TaskHandle::ready("move_trigger", ())
            };
        }

        let inner = Arc::clone(&self.inner);
        let old_world = old.world.clone();
        let new_world = new.world.clone();
        self.inner
            .pools
            .spawn(PoolCategory::Storage, "move_trigger", move || {
                if old_loaded {
                    inner.refresh_flag(&old_world);
                }
                if new_loaded {
                    inner.refresh_flag(&new_world);
                }
            })
    }

    /// Re-query the store for whether `world` has any structures
    pub fn refresh_world(&self, world: &str) -> TaskHandle<bool> {
        let inner = Arc::clone(&self.inner);
        let world = world.to_string();
        self.inner
            .pools
            .spawn(PoolCategory::Storage, "refresh_world", move || {
                inner.refresh_flag(&world).unwrap_or(false)
            })
    }

    fn spawn_flag_refresh(&self, world: &str) -> TaskHandle<()> {
        let inner = Arc::clone(&self.inner);
        let world = world.to_string();
        self.inner
            .pools
            .spawn(PoolCategory::Storage, "refresh_world_flag", move || {
                inner.refresh_flag(&world);
            })
    }

    /// Drop the chunk for `trigger` and re-check its world on this thread
    fn evict_inline(&self, trigger: &TriggerPos) {
        if self.inner.evict_chunk(&trigger.world, trigger.chunk_id()) {
            self.inner.refresh_flag(&trigger.world);
        }
    }
}

impl IndexInner {
    fn partition(&self, world: &str) -> EngineResult<Arc<WorldTriggers>> {
        self.worlds
            .get(world)
            .map(|partition| Arc::clone(partition.value()))
            .ok_or_else(|| EngineError::WorldNotLoaded {
                world: world.to_string(),
            })
    }

    fn at_trigger(&self, world: &str, x: i32, y: i32, z: i32) -> EngineResult<Vec<StructureId>> {
        let partition = self.partition(world)?;
        if !self.has_structures(world, &partition)? {
            return Ok(Vec::new());
        }
        let chunk = self.chunk(world, &partition, ChunkId::from_block(x, z))?;
        Ok(chunk.at(local_hash(x, y, z)).to_vec())
    }

    fn in_chunk(&self, world: &str, x: i32, z: i32) -> EngineResult<Vec<StructureId>> {
        let partition = self.partition(world)?;
        if !self.has_structures(world, &partition)? {
            return Ok(Vec::new());
        }
        let chunk = self.chunk(world, &partition, ChunkId::from_block(x, z))?;
        Ok(chunk.all().to_vec())
    }

    fn has_structures(&self, world: &str, partition: &WorldTriggers) -> EngineResult<bool> {
        partition.has_structures.get_or_compute(&(), || {
            guarded("has_structures_in_world", || {
                self.store.has_structures_in_world(world)
            })
        })
    }

    fn chunk(
        &self,
        world: &str,
        partition: &WorldTriggers,
        chunk: ChunkId,
    ) -> EngineResult<Arc<TriggerChunk>> {
        partition.chunks.get_or_compute(&chunk, || {
            let triggers = guarded("trigger_index_for_chunk", || {
                self.store.trigger_index_for_chunk(world, chunk)
            })?;
            let built = TriggerChunk::from_store(triggers);
            log::debug!(
                "Indexed chunk {} of {}: {} structures at {} trigger locations",
                chunk,
                world,
                built.all().len(),
                built.trigger_count()
            );
            Ok(Arc::new(built))
        })
    }

    /// Returns whether the world is loaded
    fn evict_chunk(&self, world: &str, chunk: ChunkId) -> bool {
        match self.worlds.get(world) {
            Some(partition) => {
                partition.chunks.remove(&chunk);
                true
            }
            None => false,
        }
    }

    fn refresh_flag(&self, world: &str) -> Option<bool> {
        let partition = self.partition(world).ok()?;
        partition.has_structures.remove(&());
        match self.has_structures(world, &partition) {
            Ok(has_structures) => {
                log::trace!("World {} has structures: {}", world, has_structures);
                Some(has_structures)
            }
            Err(e) => {
                log::error!("Failed to re-check structures in world {}: {}", world, e);
                None
            }
        }
    }

    fn query_failed(&self, operation: &str, world: &str, error: EngineError) -> Vec<StructureId> {
        match error {
            EngineError::WorldNotLoaded { .. } => {
                log::debug!("{} on unloaded world {}", operation, world);
            }
            other => log::error!("{} failed for world {}: {}", operation, world, other),
        }
        Vec::new()
    }
}

impl StructureListener for TriggerIndex {
    fn listener_name(&self) -> &str {
        "trigger-index"
    }

    fn on_structure_deletion(&self, snapshot: &StructureSnapshot) {
        self.evict_inline(&snapshot.trigger);
    }

    fn on_structure_creation(&self, snapshot: &StructureSnapshot) {
        self.evict_inline(&snapshot.trigger);
    }
}
