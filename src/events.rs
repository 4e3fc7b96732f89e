//! Typed lifecycle events with explicit subscription. Observers run inline on
//! the emitting task; a failing observer is logged and skipped so it can never
//! corrupt the balance update that triggered it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{error, trace};
use parking_lot::Mutex;

use crate::errors::IlpError;
use crate::transfer_log::Transfer;

/// Everything application code can observe about a plugin instance.
/// Fulfillments are base64url-encoded.
#[derive(Debug, Clone)]
pub enum PluginEvent {
    Connect,
    Disconnect,
    IncomingPrepare(Transfer),
    OutgoingPrepare(Transfer),
    IncomingFulfill(Transfer, String),
    OutgoingFulfill(Transfer, String),
    IncomingReject(Transfer, IlpError),
    OutgoingReject(Transfer, IlpError),
    IncomingCancel(Transfer, IlpError),
    OutgoingCancel(Transfer, IlpError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connect,
    Disconnect,
    IncomingPrepare,
    OutgoingPrepare,
    IncomingFulfill,
    OutgoingFulfill,
    IncomingReject,
    OutgoingReject,
    IncomingCancel,
    OutgoingCancel,
}

impl PluginEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            PluginEvent::Connect => EventKind::Connect,
            PluginEvent::Disconnect => EventKind::Disconnect,
            PluginEvent::IncomingPrepare(_) => EventKind::IncomingPrepare,
            PluginEvent::OutgoingPrepare(_) => EventKind::OutgoingPrepare,
            PluginEvent::IncomingFulfill(..) => EventKind::IncomingFulfill,
            PluginEvent::OutgoingFulfill(..) => EventKind::OutgoingFulfill,
            PluginEvent::IncomingReject(..) => EventKind::IncomingReject,
            PluginEvent::OutgoingReject(..) => EventKind::OutgoingReject,
            PluginEvent::IncomingCancel(..) => EventKind::IncomingCancel,
            PluginEvent::OutgoingCancel(..) => EventKind::OutgoingCancel,
        }
    }
}

pub type ObserverError = Box<dyn std::error::Error + Send + Sync>;
type Observer = Arc<dyn Fn(&PluginEvent) -> Result<(), ObserverError> + Send + Sync>;

/// Handle returned by `subscribe`; pass it back to `unsubscribe` to detach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionHandle(u64);

struct Subscription {
    kind: Option<EventKind>,
    observer: Observer,
}

#[derive(Default)]
pub struct EventRegistry {
    subscriptions: Mutex<HashMap<u64, Subscription>>,
    next_handle: AtomicU64,
}

impl EventRegistry {
    pub fn new() -> Self {
        EventRegistry::default()
    }

    /// Subscribes to every event.
    pub fn subscribe<F>(&self, observer: F) -> SubscriptionHandle
    where
        F: Fn(&PluginEvent) -> Result<(), ObserverError> + Send + Sync + 'static,
    {
        self.insert(None, Arc::new(observer))
    }

    /// Subscribes to one event kind.
    pub fn subscribe_kind<F>(&self, kind: EventKind, observer: F) -> SubscriptionHandle
    where
        F: Fn(&PluginEvent) -> Result<(), ObserverError> + Send + Sync + 'static,
    {
        self.insert(Some(kind), Arc::new(observer))
    }

    fn insert(&self, kind: Option<EventKind>, observer: Observer) -> SubscriptionHandle {
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.subscriptions
            .lock()
            .insert(handle, Subscription { kind, observer });
        SubscriptionHandle(handle)
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.subscriptions.lock().remove(&handle.0);
    }

    pub fn emit(&self, event: &PluginEvent) {
        trace!("emitting {:?}", event.kind());
        // observers may subscribe or unsubscribe from inside the callback, so
        // the lock is released before any of them runs
        let observers: Vec<Observer> = self
            .subscriptions
            .lock()
            .values()
            .filter(|sub| sub.kind.is_none() || sub.kind == Some(event.kind()))
            .map(|sub| sub.observer.clone())
            .collect();
        for observer in observers {
            if let Err(err) = observer(event) {
                error!("event observer failed on {:?}: {}", event.kind(), err);
            }
        }
    }
}
