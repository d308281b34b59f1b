//! Structure lifecycle listeners
//!
//! The mutation pipeline reports committed creations and deletions here. The
//! trigger index subscribes so it can drop chunks that no longer match the
//! store, without the pipeline knowing the index exists.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::error::panic_message;
use crate::structure::StructureSnapshot;

pub trait StructureListener: Send + Sync {
    fn listener_name(&self) -> &str;

    /// Called after the structure was removed from the store
    fn on_structure_deletion(&self, snapshot: &StructureSnapshot);

    /// Called after the structure was inserted into the store
    fn on_structure_creation(&self, _snapshot: &StructureSnapshot) {}
}

struct Registration {
    id: u64,
    listener: Weak<dyn StructureListener>,
}

/// Explicitly owned set of listeners, weakly held
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: RwLock<Vec<Registration>>,
    next_id: AtomicU64,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<L: StructureListener + 'static>(&self, listener: &Arc<L>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.listeners.write().push(Registration {
            id,
            listener: Arc::downgrade(listener) as Weak<dyn StructureListener>,
        });
        id
    }

    pub fn unregister(&self, id: u64) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|registration| registration.id != id);
        listeners.len() < before
    }

    /// Registered listeners that are still alive
    pub fn len(&self) -> usize {
        self.listeners
            .read()
            .iter()
            .filter(|registration| registration.listener.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.listeners.write().clear();
    }

    /// Fan a deletion out to every listener. Returns how many of them failed.
    pub fn notify_deleted(&self, snapshot: &StructureSnapshot) -> usize {
        self.fan_out("deletion", snapshot, |listener| {
            listener.on_structure_deletion(snapshot)
        })
    }

    /// Fan a creation out to every listener. Returns how many of them failed.
    pub fn notify_created(&self, snapshot: &StructureSnapshot) -> usize {
        self.fan_out("creation", snapshot, |listener| {
            listener.on_structure_creation(snapshot)
        })
    }

    fn fan_out<F>(&self, kind: &str, snapshot: &StructureSnapshot, deliver: F) -> usize
    where
        F: Fn(&dyn StructureListener),
    {
        let live: Vec<Arc<dyn StructureListener>> = {
            let mut listeners = self.listeners.write();
            listeners.retain(|registration| registration.listener.strong_count() > 0);
            listeners
                .iter()
                .filter_map(|registration| registration.listener.upgrade())
                .collect()
        };

        let mut failures = 0;
        for listener in live {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| deliver(listener.as_ref()))) {
                failures += 1;
                log::warn!(
                    "Listener {} failed handling {} of structure {}: {}",
                    listener.listener_name(),
                    kind,
                    snapshot.id,
                    panic_message(payload.as_ref())
                );
            }
        }
        failures
    }
}
