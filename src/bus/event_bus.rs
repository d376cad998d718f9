//! Process-wide typed publish/subscribe channel.
//!
//! Listeners are plain synchronous callbacks invoked inside `publish`, in
//! subscription order. Anything asynchronous (platform calls, game commands)
//! is handed off by the listener to its own worker, which is what keeps
//! per-subscriber delivery in publish order. Nothing is buffered: a listener
//! only sees events published after it subscribed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::mpsc;
use tracing::{error, trace};

use crate::bus::registry::InstanceRegistry;
use crate::common::error::IntegrityViolation;
use crate::common::{BusEvent, EventKind};

/// Callback invoked for every matching event.
pub type EventListener = Arc<dyn Fn(&Arc<BusEvent>) + Send + Sync>;

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type ListenerTable = HashMap<EventKind, Vec<(SubscriptionId, EventListener)>>;

/// The event bus shared by every component.
pub struct EventBus {
    registry: Arc<InstanceRegistry>,
    listeners: RwLock<ListenerTable>,
    next_id: AtomicU64,
    published: AtomicU64,
}

impl EventBus {
    pub fn new(registry: Arc<InstanceRegistry>) -> Self {
        Self {
            registry,
            listeners: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            published: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    /// Publish an event to every listener of its kind.
    ///
    /// Events from an instance that is not registered are dropped and never
    /// delivered.
    pub fn publish(&self, event: BusEvent) -> Result<(), IntegrityViolation> {
        if !self.registry.is_registered(&event.context.instance_name) {
            let violation = IntegrityViolation::UnregisteredPublisher {
                name: event.context.instance_name.clone(),
            };
            error!(kind = ?event.kind(), "{}", violation);
            return Err(violation);
        }

        let kind = event.kind();
        let event = Arc::new(event);

        // Snapshot the listeners so callbacks may (un)subscribe re-entrantly.
        let listeners: Vec<EventListener> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .map(|entries| entries.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default();

        trace!(
            ?kind,
            instance = %event.context.instance_name,
            listeners = listeners.len(),
            "Publishing event"
        );

        self.published.fetch_add(1, Ordering::Relaxed);
        for listener in listeners {
            listener(&event);
        }

        Ok(())
    }

    /// Invoke `listener` for every future event of `kind`.
    pub fn subscribe<F>(&self, kind: EventKind, listener: F) -> SubscriptionId
    where
        F: Fn(&Arc<BusEvent>) + Send + Sync + 'static,
    {
        self.subscribe_many(&[kind], listener)
    }

    /// Invoke one `listener` for several kinds under a single subscription id.
    pub fn subscribe_many<F>(&self, kinds: &[EventKind], listener: F) -> SubscriptionId
    where
        F: Fn(&Arc<BusEvent>) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let listener: EventListener = Arc::new(listener);

        let mut table = self
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        for kind in kinds {
            table
                .entry(*kind)
                .or_default()
                .push((id, Arc::clone(&listener)));
        }

        id
    }

    /// Forward events of the given kinds into an unbounded channel.
    ///
    /// The subscription stays registered until `unsubscribe`; events arriving
    /// after the receiver is dropped are discarded.
    pub fn subscribe_channel(
        &self,
        kinds: &[EventKind],
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<Arc<BusEvent>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.subscribe_many(kinds, move |event| {
            let _ = tx.send(Arc::clone(event));
        });
        (id, rx)
    }

    /// Remove a subscription. Returns `true` if it existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut table = self
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let mut removed = false;
        for entries in table.values_mut() {
            let before = entries.len();
            entries.retain(|(entry_id, _)| *entry_id != id);
            removed |= before != entries.len();
        }
        removed
    }

    /// Number of events delivered so far.
    pub fn events_published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}
