/// Structure Engine
///
/// Owns and wires every component: worker pools, cache sweeper, listener
/// registry, trigger index and mutation pipeline. Nothing is global; each
/// engine instance is self-contained and torn down by `shutdown` or drop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::cache::CacheSweeper;
use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::event_system::StructureEventBus;
use crate::listeners::ListenerRegistry;
use crate::pipeline::StructureManager;
use crate::storage::StructureStore;
use crate::thread_pool::{PoolCategory, PoolMetrics, ThreadPoolConfig, ThreadPoolManager};
use crate::trigger_index::TriggerIndex;

/// Upper bound on how long the sweeper sleeps between checks
const SWEEPER_TICK: Duration = Duration::from_secs(1);

pub struct StructureEngine {
    config: EngineConfig,
    pools: Arc<ThreadPoolManager>,
    sweeper: Arc<CacheSweeper>,
    listeners: Arc<ListenerRegistry>,
    trigger_index: Arc<TriggerIndex>,
    manager: StructureManager,
    running: AtomicBool,
}

impl StructureEngine {
    pub fn start(
        config: EngineConfig,
        store: Arc<dyn StructureStore>,
        events: Arc<dyn StructureEventBus>,
    ) -> EngineResult<Self> {
        let pools = Arc::new(ThreadPoolManager::new(ThreadPoolConfig::from(&config))?);
        let sweeper = Arc::new(CacheSweeper::start(SWEEPER_TICK));
        let listeners = Arc::new(ListenerRegistry::new());

        let trigger_index = Arc::new(TriggerIndex::new(
            Arc::clone(&store),
            Arc::clone(&pools),
            Arc::clone(&sweeper),
            config.trigger_cache_policy(),
            config.world_flag_policy(),
        ));
        listeners.register(&trigger_index);

        let manager = StructureManager::new(
            store,
            events,
            Arc::clone(&pools),
            Arc::clone(&listeners),
            config.created_notification_timeout(),
        );

        log::info!(
            "Structure engine started (trigger cache {} min, world flag {} min)",
            config.trigger_cache_timeout_minutes,
            config.world_flag_timeout_minutes
        );

        Ok(Self {
            config,
            pools,
            sweeper,
            listeners,
            trigger_index,
            manager,
            running: AtomicBool::new(true),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn manager(&self) -> &StructureManager {
        &self.manager
    }

    pub fn trigger_index(&self) -> &Arc<TriggerIndex> {
        &self.trigger_index
    }

    /// Registry for additional structure listeners
    pub fn listeners(&self) -> &Arc<ListenerRegistry> {
        &self.listeners
    }

    pub fn pool_metrics(&self, category: PoolCategory) -> PoolMetrics {
        self.pools.metrics(category)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stop background work and drop all cached state. Idempotent.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.sweeper.shutdown();
        self.trigger_index.unload_all();
        self.listeners.clear();
        log::info!("Structure engine shut down");
    }
}

impl Drop for StructureEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
