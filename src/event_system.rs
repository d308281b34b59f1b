/// Event System
///
/// Structure mutations announce themselves before they happen (cancellable
/// "prepare" events) and after creation succeeds (notifications). The engine
/// depends only on `StructureEventBus`; `EventBus` is the in-process
/// implementation with prioritised, weakly held subscribers.
///
/// Features:
/// - Veto of any pending create / delete / add-owner / remove-owner
/// - Priority ordering of subscribers
/// - Panicking subscribers are isolated and counted, never propagated

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{panic_message, EngineError, EngineResult};
use crate::structure::{PlayerData, StructureData, StructureOwner, StructureSnapshot};

/// Event priority levels
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EventPriority {
    Low = 0,
    Normal = 1,
    High = 2,
    Critical = 3,
}

/// What a cancellable event is asking permission for
#[derive(Debug, Clone)]
pub enum PrepareAction {
    Create { data: StructureData },
    Delete { snapshot: StructureSnapshot },
    AddOwner { snapshot: StructureSnapshot, owner: StructureOwner },
    RemoveOwner { snapshot: StructureSnapshot, owner: StructureOwner },
}

/// Event fired before a mutation; any subscriber may cancel it
#[derive(Debug, Clone)]
pub struct CancellableEvent {
    pub action: PrepareAction,
    /// Player on whose behalf the mutation runs, if any
    pub responsible: Option<PlayerData>,
    cancelled: bool,
}

impl CancellableEvent {
    pub fn new(action: PrepareAction, responsible: Option<PlayerData>) -> Self {
        Self {
            action,
            responsible,
            cancelled: false,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self.action {
            PrepareAction::Create { .. } => "PrepareCreate",
            PrepareAction::Delete { .. } => "PrepareDelete",
            PrepareAction::AddOwner { .. } => "PrepareAddOwner",
            PrepareAction::RemoveOwner { .. } => "PrepareRemoveOwner",
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn set_cancelled(&mut self, cancelled: bool) {
        self.cancelled = cancelled;
    }
}

/// Event fired after the fact; cannot be cancelled
#[derive(Debug, Clone)]
pub enum NotificationEvent {
    Created {
        snapshot: StructureSnapshot,
        responsible: Option<PlayerData>,
    },
}

impl NotificationEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            NotificationEvent::Created { .. } => "Created",
        }
    }
}

/// Boundary the mutation pipeline fires events through
pub trait StructureEventBus: Send + Sync {
    /// Deliver to every subscriber and return the event as they left it
    fn fire_cancellable(&self, event: CancellableEvent) -> CancellableEvent;

    /// Best-effort delivery. `Err` reports subscribers that failed.
    fn fire_notification(&self, event: &NotificationEvent) -> EngineResult<()>;
}

/// Event handler trait for receiving events
pub trait EventHandler: Send + Sync {
    fn on_prepare(&self, _event: &mut CancellableEvent) {}
    fn on_notification(&self, _event: &NotificationEvent) {}
    fn handler_name(&self) -> &str {
        "unnamed_handler"
    }
}

/// Event subscription handle
struct EventSubscription {
    id: u64,
    handler: Weak<dyn EventHandler>,
    priority: EventPriority,
    subscriber_name: String,
    created_at: Instant,
}

/// Event bus statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventBusStats {
    pub events_published: u64,
    pub events_cancelled: u64,
    pub handler_failures: u64,
    pub active_subscriptions: usize,
}

/// In-process event bus
pub struct EventBus {
    subscriptions: RwLock<Vec<EventSubscription>>,
    next_subscription_id: AtomicU64,
    stats: RwLock<EventBusStats>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(Vec::new()),
            next_subscription_id: AtomicU64::new(1),
            stats: RwLock::new(EventBusStats::default()),
        }
    }

    /// Subscribe a handler. The bus only keeps a weak reference.
    pub fn subscribe<H: EventHandler + 'static>(
        &self,
        handler: &Arc<H>,
        priority: EventPriority,
        subscriber_name: impl Into<String>,
    ) -> u64 {
        let subscription_id = self.next_subscription_id.fetch_add(1, Ordering::SeqCst);
        let handler: Weak<dyn EventHandler> = Arc::downgrade(handler) as Weak<dyn EventHandler>;

        let subscription = EventSubscription {
            id: subscription_id,
            handler,
            priority,
            subscriber_name: subscriber_name.into(),
            created_at: Instant::now(),
        };

        {
            let mut subscriptions = self.subscriptions.write();
            subscriptions.push(subscription);
            // Higher priority handlers run first, ties in subscription order
            subscriptions.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
        }

        self.stats.write().active_subscriptions += 1;
        subscription_id
    }

    /// Unsubscribe from events
    pub fn unsubscribe(&self, subscription_id: u64) -> bool {
        let mut subscriptions = self.subscriptions.write();
        let before = subscriptions.len();
        subscriptions.retain(|s| s.id != subscription_id);
        let found = subscriptions.len() < before;

        if found {
            let mut stats = self.stats.write();
            stats.active_subscriptions = stats.active_subscriptions.saturating_sub(1);
        }
        found
    }

    /// Clean up subscriptions whose handler has been dropped
    pub fn cleanup_subscriptions(&self) {
        let mut subscriptions = self.subscriptions.write();
        let original_len = subscriptions.len();
        subscriptions.retain(|sub| sub.handler.upgrade().is_some());
        let removed = original_len - subscriptions.len();

        if removed > 0 {
            log::debug!("Cleaned up {} dead subscriptions", removed);
            let mut stats = self.stats.write();
            stats.active_subscriptions = stats.active_subscriptions.saturating_sub(removed);
        }
    }

    pub fn get_stats(&self) -> EventBusStats {
        self.stats.read().clone()
    }

    /// Live handlers in delivery order. Taken up front so no lock is held while handlers run.
    fn live_handlers(&self) -> Vec<(String, Arc<dyn EventHandler>)> {
        self.subscriptions
            .read()
            .iter()
            .filter_map(|sub| {
                sub.handler.upgrade().map(|handler| {
                    log::trace!(
                        "Delivering to {} (subscribed {:?} ago)",
                        sub.subscriber_name,
                        sub.created_at.elapsed()
                    );
                    (sub.subscriber_name.clone(), handler)
                })
            })
            .collect()
    }

    fn record_failure(&self, subscriber: &str, event_type: &str, payload: &(dyn std::any::Any + Send)) -> EngineError {
        let reason = panic_message(payload);
        log::warn!(
            "Handler {} failed while handling {}: {}",
            subscriber,
            event_type,
            reason
        );
        self.stats.write().handler_failures += 1;
        EngineError::NotifierFailure {
            subscriber: subscriber.to_string(),
            reason,
        }
    }
}

impl StructureEventBus for EventBus {
    fn fire_cancellable(&self, mut event: CancellableEvent) -> CancellableEvent {
        let event_type = event.event_type();
        for (name, handler) in self.live_handlers() {
            let result = catch_unwind(AssertUnwindSafe(|| handler.on_prepare(&mut event)));
            if let Err(payload) = result {
                self.record_failure(&name, event_type, payload.as_ref());
            }
        }

        let mut stats = self.stats.write();
        stats.events_published += 1;
        if event.is_cancelled() {
            stats.events_cancelled += 1;
            log::debug!("{} was cancelled by a subscriber", event_type);
        }
        event
    }

    fn fire_notification(&self, event: &NotificationEvent) -> EngineResult<()> {
        let event_type = event.event_type();
        let mut first_failure = None;
        for (name, handler) in self.live_handlers() {
            let result = catch_unwind(AssertUnwindSafe(|| handler.on_notification(event)));
            if let Err(payload) = result {
                let error = self.record_failure(&name, event_type, payload.as_ref());
                first_failure.get_or_insert(error);
            }
        }

        self.stats.write().events_published += 1;
        match first_failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structure::{Cuboid, StructureType};
    use crate::world::TriggerPos;
    use parking_lot::Mutex;

    struct RecordingHandler {
        name: String,
        seen: Arc<Mutex<Vec<String>>>,
        cancel: bool,
    }

    impl EventHandler for RecordingHandler {
        fn on_prepare(&self, event: &mut CancellableEvent) {
            self.seen
                .lock()
                .push(format!("{}:{}:{}", self.name, event.event_type(), event.is_cancelled()));
            if self.cancel {
                event.set_cancelled(true);
            }
        }

        fn on_notification(&self, event: &NotificationEvent) {
            self.seen.lock().push(format!("{}:{}", self.name, event.event_type()));
        }

        fn handler_name(&self) -> &str {
            &self.name
        }
    }

    struct PanickingHandler;

    impl EventHandler for PanickingHandler {
        fn on_prepare(&self, _event: &mut CancellableEvent) {
            panic!("subscriber bug");
        }

        fn on_notification(&self, _event: &NotificationEvent) {
            panic!("subscriber bug");
        }
    }

    fn create_event() -> CancellableEvent {
        CancellableEvent::new(
            PrepareAction::Create {
                data: StructureData::new(
                    "door",
                    StructureType::BigDoor,
                    Cuboid::new([0, 64, 0], [1, 66, 0]),
                    TriggerPos::new("alpha", 0, 64, 0),
                    PlayerData::new(1, "alice"),
                ),
            },
            None,
        )
    }

    fn recorder(name: &str, seen: &Arc<Mutex<Vec<String>>>, cancel: bool) -> Arc<RecordingHandler> {
        Arc::new(RecordingHandler {
            name: name.to_string(),
            seen: seen.clone(),
            cancel,
        })
    }

    #[test]
    fn test_event_bus_creation() {
        let bus = EventBus::new();
        let stats = bus.get_stats();
        assert_eq!(stats.active_subscriptions, 0);
        assert_eq!(stats.events_published, 0);
    }

    #[test]
    fn test_priority_order_and_cancellation_visibility() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let low = recorder("low", &seen, false);
        let high = recorder("high", &seen, true);

        bus.subscribe(&low, EventPriority::Low, "low");
        bus.subscribe(&high, EventPriority::High, "high");

        let event = bus.fire_cancellable(create_event());
        assert!(event.is_cancelled());
        assert_eq!(
            *seen.lock(),
            vec!["high:PrepareCreate:false".to_string(), "low:PrepareCreate:true".to_string()]
        );
        assert_eq!(bus.get_stats().events_cancelled, 1);
    }

    #[test]
    fn test_panicking_handler_does_not_stop_others() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let bad = Arc::new(PanickingHandler);
        let good = recorder("good", &seen, false);

        bus.subscribe(&bad, EventPriority::Critical, "bad");
        bus.subscribe(&good, EventPriority::Normal, "good");

        let event = bus.fire_cancellable(create_event());
        assert!(!event.is_cancelled());
        assert_eq!(seen.lock().len(), 1);

        let snapshot = match create_event().action {
            PrepareAction::Create { data } => {
                crate::structure::Structure::new(crate::structure::StructureId(1), data).snapshot()
            }
            _ => unreachable!(),
        };
        let result = bus.fire_notification(&NotificationEvent::Created {
            snapshot,
            responsible: None,
        });
        assert!(matches!(result, Err(EngineError::NotifierFailure { .. })));
        assert_eq!(seen.lock().len(), 2);
        assert_eq!(bus.get_stats().handler_failures, 2);
    }

    #[test]
    fn test_cleanup_subscriptions() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        {
            let handler = recorder("temp", &seen, false);
            bus.subscribe(&handler, EventPriority::Normal, "temp");
        } // handler goes out of scope and is dropped

        assert_eq!(bus.get_stats().active_subscriptions, 1);
        bus.fire_cancellable(create_event());
        assert!(seen.lock().is_empty());

        bus.cleanup_subscriptions();
        assert_eq!(bus.get_stats().active_subscriptions, 0);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handler = recorder("h", &seen, true);
        let id = bus.subscribe(&handler, EventPriority::Normal, "h");

        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        assert!(!bus.fire_cancellable(create_event()).is_cancelled());
    }
}
