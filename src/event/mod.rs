//! Contains the events and subscriber types used for monitoring the activities of a
//! [`Client`](../struct.Client.html).
//!
//! Subscribers are registered on a [`MonitoringRegistry`]; a `Client` uses the registry handed to
//! it via [`ClientOptions::monitoring`](../options/struct.ClientOptions.html), falling back to the
//! process-wide default registry returned by [`MonitoringRegistry::global`]. Registering a
//! subscriber before the `Client` is constructed guarantees that no events are missed.

pub mod cmap;
pub mod command;
pub mod sdam;

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
    RwLock,
};

use lazy_static::lazy_static;

use self::{cmap::CmapEvent, command::CommandEvent, sdam::SdamEvent};

/// A subscriber for SDAM events.
pub trait SdamEventSubscriber: Send + Sync {
    /// Handle the given event. Events for a given topology are delivered in order; a slow
    /// subscriber delays other subscribers but never topology updates themselves.
    fn handle(&self, event: &SdamEvent);
}

/// A subscriber for connection pool (CMAP) events.
pub trait CmapEventSubscriber: Send + Sync {
    /// Handle the given event. Events for a given pool are delivered in order.
    fn handle(&self, event: &CmapEvent);
}

/// A subscriber for command monitoring events.
pub trait CommandEventSubscriber: Send + Sync {
    /// Handle the given event. The started event for a command is always delivered before its
    /// succeeded or failed event.
    fn handle(&self, event: &CommandEvent);
}

impl<F: Fn(&SdamEvent) + Send + Sync> SdamEventSubscriber for F {
    fn handle(&self, event: &SdamEvent) {
        self(event)
    }
}

impl<F: Fn(&CmapEvent) + Send + Sync> CmapEventSubscriber for F {
    fn handle(&self, event: &CmapEvent) {
        self(event)
    }
}

impl<F: Fn(&CommandEvent) + Send + Sync> CommandEventSubscriber for F {
    fn handle(&self, event: &CommandEvent) {
        self(event)
    }
}

/// A token returned from the `subscribe_*` methods of [`MonitoringRegistry`] that can be used to
/// unsubscribe the corresponding subscriber.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriberHandle(u64);

lazy_static! {
    static ref GLOBAL_REGISTRY: MonitoringRegistry = MonitoringRegistry::new();
}

/// A registry of event subscribers, cheap to clone and share between clients.
///
/// Each `Client` is associated with exactly one registry. The process-wide default registry is an
/// ordinary instance of this type, so tests and applications that want isolation can construct
/// their own with [`MonitoringRegistry::new`] and inject it via `ClientOptions`.
#[derive(Clone, Default)]
pub struct MonitoringRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    next_id: AtomicU64,
    sdam: RwLock<Vec<(u64, Arc<dyn SdamEventSubscriber>)>>,
    cmap: RwLock<Vec<(u64, Arc<dyn CmapEventSubscriber>)>>,
    command: RwLock<Vec<(u64, Arc<dyn CommandEventSubscriber>)>>,
}

impl std::fmt::Debug for MonitoringRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitoringRegistry").finish()
    }
}

impl MonitoringRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide default registry used by clients that are not given their own.
    pub fn global() -> MonitoringRegistry {
        GLOBAL_REGISTRY.clone()
    }

    /// Registers a subscriber for SDAM events, returning a handle that can be passed to
    /// [`unsubscribe`](Self::unsubscribe).
    pub fn subscribe_sdam(&self, subscriber: Arc<dyn SdamEventSubscriber>) -> SubscriberHandle {
        let id = self.next_id();
        if let Ok(mut subscribers) = self.inner.sdam.write() {
            subscribers.push((id, subscriber));
        }
        SubscriberHandle(id)
    }

    /// Registers a subscriber for connection pool events, returning a handle that can be passed
    /// to [`unsubscribe`](Self::unsubscribe).
    pub fn subscribe_cmap(&self, subscriber: Arc<dyn CmapEventSubscriber>) -> SubscriberHandle {
        let id = self.next_id();
        if let Ok(mut subscribers) = self.inner.cmap.write() {
            subscribers.push((id, subscriber));
        }
        SubscriberHandle(id)
    }

    /// Registers a subscriber for command monitoring events, returning a handle that can be
    /// passed to [`unsubscribe`](Self::unsubscribe).
    pub fn subscribe_command(
        &self,
        subscriber: Arc<dyn CommandEventSubscriber>,
    ) -> SubscriberHandle {
        let id = self.next_id();
        if let Ok(mut subscribers) = self.inner.command.write() {
            subscribers.push((id, subscriber));
        }
        SubscriberHandle(id)
    }

    /// Removes the subscriber associated with the given handle, if it is still registered.
    pub fn unsubscribe(&self, handle: SubscriberHandle) {
        if let Ok(mut subscribers) = self.inner.sdam.write() {
            subscribers.retain(|(id, _)| *id != handle.0);
        }
        if let Ok(mut subscribers) = self.inner.cmap.write() {
            subscribers.retain(|(id, _)| *id != handle.0);
        }
        if let Ok(mut subscribers) = self.inner.command.write() {
            subscribers.retain(|(id, _)| *id != handle.0);
        }
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn emit_sdam(&self, event: &SdamEvent) {
        if let Ok(subscribers) = self.inner.sdam.read() {
            for (_, subscriber) in subscribers.iter() {
                subscriber.handle(event);
            }
        }
    }

    pub(crate) fn emit_cmap(&self, event: &CmapEvent) {
        if let Ok(subscribers) = self.inner.cmap.read() {
            for (_, subscriber) in subscribers.iter() {
                subscriber.handle(event);
            }
        }
    }

    pub(crate) fn emit_command(&self, event: &CommandEvent) {
        if let Ok(subscribers) = self.inner.command.read() {
            for (_, subscriber) in subscribers.iter() {
                subscriber.handle(event);
            }
        }
    }
}
