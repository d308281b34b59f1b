/// Mutation Pipeline
///
/// Every structure mutation follows the same path:
/// 1. Fire a cancellable "prepare" event on the event pool
/// 2. Once subscribers are done, continue on the storage pool
/// 3. Apply the change to the live structure (owner changes only)
/// 4. Persist through the store, compensating the live change on refusal
/// 5. Fan the outcome out to listeners
///
/// Callers get a `PendingAction` immediately and never see an error: only
/// `Success`, `Cancelled` or `Fail`.

mod mutation;

pub use mutation::{run_optimistic, AddOwnerMutation, OptimisticMutation, RemoveOwnerMutation};

use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::{select, Either};
use futures_timer::Delay;

use crate::error::{EngineError, EngineResult};
use crate::event_system::{CancellableEvent, NotificationEvent, PrepareAction, StructureEventBus};
use crate::listeners::ListenerRegistry;
use crate::storage::{guarded, StructureStore};
use crate::structure::{
    PermissionLevel, PlayerData, PlayerId, Structure, StructureData, StructureId, StructureOwner,
    StructureSnapshot,
};
use crate::thread_pool::{PoolCategory, TaskHandle, ThreadPoolManager};

/// Outcome of a delete or ownership change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ActionResult {
    Success,
    /// A prepare-event subscriber vetoed the action
    Cancelled,
    #[default]
    Fail,
}

/// Outcome of a create
#[derive(Debug, Clone, Default)]
pub struct CreationResult {
    pub structure: Option<Arc<Structure>>,
    pub cancelled: bool,
}

impl CreationResult {
    fn created(structure: Arc<Structure>) -> Self {
        Self {
            structure: Some(structure),
            cancelled: false,
        }
    }

    fn cancelled() -> Self {
        Self {
            structure: None,
            cancelled: true,
        }
    }

    fn failed() -> Self {
        Self::default()
    }

    pub fn is_success(&self) -> bool {
        self.structure.is_some()
    }
}

/// Future for a pipeline operation.
///
/// Resolves to the operation's result. A worker task that died without one
/// resolves to the type's default (`Fail`, nothing found).
pub struct PendingAction<T> {
    task: TaskHandle<T>,
}

impl<T> PendingAction<T> {
    fn new(task: TaskHandle<T>) -> Self {
        Self { task }
    }

    fn ready(name: &str, value: T) -> Self {
        Self::new(TaskHandle::ready(name, value))
    }

    pub fn name(&self) -> &str {
        self.task.name()
    }
}

impl<T: Default> PendingAction<T> {
    /// Block the current thread until the operation finishes
    pub fn wait(self) -> T {
        futures::executor::block_on(self)
    }
}

impl<T: Default> Future for PendingAction<T> {
    type Output = T;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.task).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(value)) => Poll::Ready(value),
            Poll::Ready(Err(e)) => {
                log::error!("Pipeline operation failed without a result: {}", e);
                Poll::Ready(T::default())
            }
        }
    }
}

struct ManagerInner {
    store: Arc<dyn StructureStore>,
    events: Arc<dyn StructureEventBus>,
    pools: Arc<ThreadPoolManager>,
    listeners: Arc<ListenerRegistry>,
    created_timeout: Duration,
}

/// Runs create / delete / ownership changes against the store
#[derive(Clone)]
pub struct StructureManager {
    inner: Arc<ManagerInner>,
}

impl StructureManager {
    pub fn new(
        store: Arc<dyn StructureStore>,
        events: Arc<dyn StructureEventBus>,
        pools: Arc<ThreadPoolManager>,
        listeners: Arc<ListenerRegistry>,
        created_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                store,
                events,
                pools,
                listeners,
                created_timeout,
            }),
        }
    }

    pub fn listeners(&self) -> &Arc<ListenerRegistry> {
        &self.inner.listeners
    }

    /// Persist a new structure
    pub fn create(
        &self,
        data: StructureData,
        responsible: Option<PlayerData>,
    ) -> PendingAction<CreationResult> {
        let event = CancellableEvent::new(
            PrepareAction::Create { data: data.clone() },
            responsible.clone(),
        );
        self.after_prepare("create", event, move |inner, event| {
            if event.is_cancelled() {
                log::debug!("Creation of {} was cancelled", data.name);
                return CreationResult::cancelled();
            }
            inner.create(data, responsible)
        })
    }

    /// Remove a structure from the store. On success `structure` becomes invalid.
    pub fn delete(
        &self,
        structure: &Arc<Structure>,
        responsible: Option<PlayerData>,
    ) -> PendingAction<ActionResult> {
        let event = CancellableEvent::new(
            PrepareAction::Delete {
                snapshot: structure.snapshot(),
            },
            responsible.clone(),
        );
        let structure = Arc::clone(structure);
        self.after_prepare("delete", event, move |inner, event| {
            if was_cancelled(&event, structure.id()) {
                return ActionResult::Cancelled;
            }
            inner.delete(&structure, responsible)
        })
    }

    /// Grant `player` the given level on `structure`
    pub fn add_owner(
        &self,
        structure: &Arc<Structure>,
        player: PlayerData,
        level: PermissionLevel,
        responsible: Option<PlayerData>,
    ) -> PendingAction<ActionResult> {
        if !level.is_grantable() {
            log::debug!(
                "Refusing to add {} to structure {}: {}",
                player,
                structure.id(),
                EngineError::InvalidPermission { level }
            );
            return PendingAction::ready("add_owner", ActionResult::Fail);
        }
        if structure.owner(player.id).map_or(false, |owner| owner.is_creator()) {
            log::debug!(
                "Refusing to change the creator level of structure {}",
                structure.id()
            );
            return PendingAction::ready("add_owner", ActionResult::Fail);
        }

        let owner = StructureOwner::new(structure.id(), player.clone(), level);
        let event = CancellableEvent::new(
            PrepareAction::AddOwner {
                snapshot: structure.snapshot(),
                owner: owner.clone(),
            },
            responsible.clone(),
        );
        let structure = Arc::clone(structure);
        self.after_prepare("add_owner", event, move |inner, event| {
            if was_cancelled(&event, structure.id()) {
                return ActionResult::Cancelled;
            }
            inner.add_owner(&structure, owner, responsible)
        })
    }

    /// Revoke `player`'s ownership of `structure`. The creator cannot be removed.
    pub fn remove_owner(
        &self,
        structure: &Arc<Structure>,
        player: PlayerId,
        responsible: Option<PlayerData>,
    ) -> PendingAction<ActionResult> {
        let owner = match structure.owner(player) {
            Some(owner) => owner,
            None => {
                log::debug!("Player {} does not own structure {}", player, structure.id());
                return PendingAction::ready("remove_owner", ActionResult::Fail);
            }
        };
        if owner.is_creator() {
            log::debug!(
                "Refusing to remove the creator of structure {}",
                structure.id()
            );
            return PendingAction::ready("remove_owner", ActionResult::Fail);
        }

        let event = CancellableEvent::new(
            PrepareAction::RemoveOwner {
                snapshot: structure.snapshot(),
                owner,
            },
            responsible.clone(),
        );
        let structure = Arc::clone(structure);
        self.after_prepare("remove_owner", event, move |inner, event| {
            if was_cancelled(&event, structure.id()) {
                return ActionResult::Cancelled;
            }
            inner.remove_owner(&structure, player, responsible)
        })
    }

    /// Persist the open and locked flags of a live structure
    pub fn sync_data(&self, structure: &Arc<Structure>) -> PendingAction<ActionResult> {
        let inner = Arc::clone(&self.inner);
        let snapshot = structure.snapshot();
        self.spawn("sync_data", move || {
            let synced = inner
                .call_store("sync_base", &snapshot.id, None, |store| {
                    store.sync_base(&snapshot)
                })
                .unwrap_or(false);
            if synced {
                ActionResult::Success
            } else {
                log::error!("Failed to sync structure {}", snapshot.id);
                ActionResult::Fail
            }
        })
    }

    /// Load a structure from the store
    pub fn get_structure(&self, id: StructureId) -> PendingAction<Option<Arc<Structure>>> {
        let inner = Arc::clone(&self.inner);
        self.spawn("get_structure", move || {
            inner
                .call_store("get_structure", &id, None, |store| store.get_structure(id))
                .flatten()
                .map(|snapshot| Arc::new(Structure::from_snapshot(&snapshot)))
        })
    }

    /// Ids of every structure `player` owns at any level
    pub fn structures_owned_by(&self, player: PlayerId) -> PendingAction<Vec<StructureId>> {
        let inner = Arc::clone(&self.inner);
        self.spawn("structures_owned_by", move || {
            inner
                .call_store("structures_owned_by", &player, None, |store| {
                    store.structures_owned_by(player)
                })
                .unwrap_or_default()
        })
    }

    fn spawn<F, R>(&self, name: &str, task: F) -> PendingAction<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        PendingAction::new(self.inner.pools.spawn(PoolCategory::Storage, name, task))
    }

    /// Fire `event` on the event pool, then run `proceed` on the storage pool.
    ///
    /// The storage stage is only queued once subscribers are done, so a slow
    /// subscriber holds an event thread and never a storage thread.
    fn after_prepare<F, R>(&self, name: &str, event: CancellableEvent, proceed: F) -> PendingAction<R>
    where
        F: FnOnce(&ManagerInner, CancellableEvent) -> R + Send + 'static,
        R: Send + 'static,
    {
        let bus = Arc::clone(&self.inner.events);
        let inner = Arc::clone(&self.inner);
        PendingAction::new(self.inner.pools.spawn_then(
            PoolCategory::Events,
            PoolCategory::Storage,
            name,
            move || bus.fire_cancellable(event),
            move |event| proceed(&inner, event),
        ))
    }
}

fn was_cancelled(event: &CancellableEvent, structure: StructureId) -> bool {
    if event.is_cancelled() {
        log::debug!("{} for structure {} was cancelled", event.event_type(), structure);
    }
    event.is_cancelled()
}

impl ManagerInner {
    fn create(&self, data: StructureData, responsible: Option<PlayerData>) -> CreationResult {
        let inserted = self
            .call_store("insert", &data.name, responsible.as_ref(), |store| {
                store.insert(&data)
            })
            .flatten();
        let structure = match inserted {
            Some(structure) => Arc::new(structure),
            None => {
                log::error!(
                    "Failed to insert structure {} at {} for {}",
                    data.name,
                    data.trigger,
                    responsible_name(responsible.as_ref())
                );
                return CreationResult::failed();
            }
        };

        let snapshot = structure.snapshot();
        log::info!("Created structure {} ({}) at {}", snapshot.id, snapshot.name, snapshot.trigger);
        self.listeners.notify_created(&snapshot);
        self.announce_created(snapshot, responsible);
        CreationResult::created(structure)
    }

    fn delete(&self, structure: &Structure, responsible: Option<PlayerData>) -> ActionResult {
        // Subscribers may have changed the structure while the event was out
        let snapshot = structure.snapshot();
        let removed = self
            .call_store("remove_by_id", &snapshot.id, responsible.as_ref(), |store| {
                store.remove_by_id(snapshot.id)
            })
            .unwrap_or(false);
        if !removed {
            log::error!(
                "Failed to delete structure {} for {}",
                snapshot.id,
                responsible_name(responsible.as_ref())
            );
            return ActionResult::Fail;
        }

        structure.invalidate();
        let failures = self.listeners.notify_deleted(&snapshot);
        if failures > 0 {
            log::warn!(
                "{} listeners failed handling deletion of structure {}",
                failures,
                snapshot.id
            );
        }
        log::info!("Deleted structure {} ({})", snapshot.id, snapshot.name);
        ActionResult::Success
    }

    fn add_owner(
        &self,
        structure: &Structure,
        owner: StructureOwner,
        responsible: Option<PlayerData>,
    ) -> ActionResult {
        let player = owner.player.clone();
        let level = owner.level;
        let mut mutation = AddOwnerMutation::new(owner);
        run_optimistic(structure, &mut mutation, || {
            self.call_store("add_owner", &structure.id(), responsible.as_ref(), |store| {
                store.add_owner(structure.id(), &player, level)
            })
            .unwrap_or(false)
        })
    }

    fn remove_owner(
        &self,
        structure: &Structure,
        player: PlayerId,
        responsible: Option<PlayerData>,
    ) -> ActionResult {
        let mut mutation = RemoveOwnerMutation::new(player);
        run_optimistic(structure, &mut mutation, || {
            self.call_store("remove_owner", &structure.id(), responsible.as_ref(), |store| {
                store.remove_owner(structure.id(), player)
            })
            .unwrap_or(false)
        })
    }

    /// Fire the created notification without holding up the caller.
    ///
    /// Delivery is bounded by `created_timeout`; a late or failed delivery is
    /// logged and the structure stays persisted.
    fn announce_created(&self, snapshot: StructureSnapshot, responsible: Option<PlayerData>) {
        let id = snapshot.id;
        let bus = Arc::clone(&self.events);
        let event = NotificationEvent::Created {
            snapshot,
            responsible,
        };
        let delivery = self
            .pools
            .spawn(PoolCategory::Events, "notify_created", move || {
                bus.fire_notification(&event)
            });

        let timeout = self.created_timeout;
        self.pools.watch(async move {
            match select(delivery, Box::pin(Delay::new(timeout))).await {
                Either::Left((Ok(Ok(())), _)) => {
                    log::trace!("Created notification for structure {} delivered", id);
                }
                Either::Left((Ok(Err(e)), _)) | Either::Left((Err(e), _)) => {
                    log::warn!("Created notification for structure {} failed: {}", id, e);
                }
                Either::Right(_) => {
                    log::warn!(
                        "Created notification for structure {} timed out after {:?}",
                        id,
                        timeout
                    );
                }
            }
        });
    }

    /// Run a store call, logging adapter errors with full context
    fn call_store<T, F>(
        &self,
        operation: &str,
        target: &dyn Display,
        responsible: Option<&PlayerData>,
        call: F,
    ) -> Option<T>
    where
        F: FnOnce(&dyn StructureStore) -> EngineResult<T>,
    {
        match guarded(operation, || call(self.store.as_ref())) {
            Ok(value) => Some(value),
            Err(e) => {
                log::error!(
                    "Store call {} on {} for {} failed: {}",
                    operation,
                    target,
                    responsible_name(responsible),
                    e
                );
                None
            }
        }
    }
}

fn responsible_name(responsible: Option<&PlayerData>) -> String {
    responsible.map_or_else(|| "server".to_string(), |player| player.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_system::{EventBus, EventHandler, EventPriority};
    use crate::storage::{MemoryStore, StoreFault, StoreMethod};
    use crate::structure::{Cuboid, StructureType};
    use crate::thread_pool::ThreadPoolConfig;
    use crate::world::TriggerPos;

    struct Veto;

    impl EventHandler for Veto {
        fn on_prepare(&self, event: &mut CancellableEvent) {
            event.set_cancelled(true);
        }

        fn handler_name(&self) -> &str {
            "veto"
        }
    }

    fn manager(store: &Arc<MemoryStore>, bus: &Arc<EventBus>) -> StructureManager {
        let pools = Arc::new(
            ThreadPoolManager::new(ThreadPoolConfig::default()).expect("Failed to create pools"),
        );
        StructureManager::new(
            store.clone(),
            bus.clone(),
            pools,
            Arc::new(ListenerRegistry::new()),
            Duration::from_secs(10),
        )
    }

    fn door() -> StructureData {
        StructureData::new(
            "door",
            StructureType::BigDoor,
            Cuboid::new([0, 64, 0], [2, 67, 0]),
            TriggerPos::new("alpha", 5, 64, 5),
            PlayerData::new(1, "alice"),
        )
    }

    #[test]
    fn test_create_assigns_creator() {
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(EventBus::new());
        let manager = manager(&store, &bus);

        let result = manager.create(door(), None).wait();
        let structure = result.structure.expect("Failed to create structure");
        assert!(!result.cancelled);
        assert_eq!(structure.creator().map(|o| o.player.id), Some(PlayerId(1)));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_cancelled_create_skips_store() {
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(EventBus::new());
        let veto = Arc::new(Veto);
        bus.subscribe(&veto, EventPriority::Normal, "veto");
        let manager = manager(&store, &bus);

        let result = manager.create(door(), None).wait();
        assert!(result.cancelled);
        assert!(result.structure.is_none());
        assert_eq!(store.calls(StoreMethod::Insert), 0);
    }

    #[test]
    fn test_refused_insert_is_failure() {
        let store = Arc::new(MemoryStore::new());
        store.inject_fault(StoreMethod::Insert, StoreFault::Refuse);
        let bus = Arc::new(EventBus::new());
        let manager = manager(&store, &bus);

        let result = manager.create(door(), Some(PlayerData::new(1, "alice"))).wait();
        assert!(!result.cancelled);
        assert!(!result.is_success());
    }

    #[derive(Default)]
    struct PrepareLog {
        seen: parking_lot::Mutex<Vec<&'static str>>,
    }

    impl EventHandler for PrepareLog {
        fn on_prepare(&self, event: &mut CancellableEvent) {
            self.seen.lock().push(event.event_type());
        }
    }

    #[test]
    fn test_invalid_level_fails_without_event() {
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(EventBus::new());
        let log = Arc::new(PrepareLog::default());
        bus.subscribe(&log, EventPriority::Normal, "prepare-log");
        let manager = manager(&store, &bus);
        let structure = manager.create(door(), None).wait().structure.expect("Failed to create");

        for level in [PermissionLevel::NoPermission, PermissionLevel::Creator] {
            let result = manager
                .add_owner(&structure, PlayerData::new(2, "bob"), level, None)
                .wait();
            assert_eq!(result, ActionResult::Fail);
        }
        assert_eq!(*log.seen.lock(), vec!["PrepareCreate"]);
        assert_eq!(store.calls(StoreMethod::AddOwner), 0);
    }

    #[test]
    fn test_sync_data_persists_flags() {
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(EventBus::new());
        let manager = manager(&store, &bus);
        let structure = manager.create(door(), None).wait().structure.expect("Failed to create");

        structure.set_open(true);
        assert_eq!(manager.sync_data(&structure).wait(), ActionResult::Success);
        let reloaded = manager
            .get_structure(structure.id())
            .wait()
            .expect("Failed to reload structure");
        assert!(reloaded.state().is_open);
    }

    #[test]
    fn test_owned_by_query() {
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(EventBus::new());
        let manager = manager(&store, &bus);
        let first = manager.create(door(), None).wait().structure.expect("Failed to create");
        let second = manager.create(door(), None).wait().structure.expect("Failed to create");

        let owned = manager.structures_owned_by(PlayerId(1)).wait();
        assert_eq!(owned, vec![first.id(), second.id()]);
        assert!(manager.structures_owned_by(PlayerId(9)).wait().is_empty());
    }
}
