//! Subscription registry and handles.
//!
//! A registration exists for a subscription id as long as at least one listener is attached
//! to it. The registry is shared between the [`DataClient`](crate::client::DataClient), which
//! adds listeners, the handles, which remove them, and the push driver, which reads it to
//! route frames and to resubscribe after reconnecting. The lock is never held while a
//! listener runs.
use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use tether_common::dto::GraphRequest;

use crate::connection::Command;

/// Event delivered to subscription listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent {
    /// Payload of a `data` frame.
    Data(Value),
    /// Payload of an `error` frame.
    Error(Value),
}

pub type Listener = Arc<dyn Fn(&SubscriptionEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct ListenerEntry {
    callback: Listener,
    /// Cleared on removal so a snapshot taken before removal skips the listener.
    active: Arc<AtomicBool>,
}

struct Registration {
    request: GraphRequest,
    listeners: HashMap<ListenerId, ListenerEntry>,
}

/// Outcome of [`Registry::add`].
pub(crate) struct Added {
    pub listener: ListenerId,
    /// True when the listener created the registration.
    pub created: bool,
}

#[derive(Default)]
pub(crate) struct Registry {
    registrations: HashMap<String, Registration>,
    next_listener: u64,
}

impl Registry {
    pub fn add(&mut self, id: &str, request: GraphRequest, callback: Listener) -> Added {
        self.next_listener += 1;
        let listener = ListenerId(self.next_listener);
        let entry = ListenerEntry { callback, active: Arc::new(AtomicBool::new(true)) };
        let created = !self.registrations.contains_key(id);
        self.registrations
            .entry(id.to_string())
            .or_insert_with(|| Registration { request, listeners: HashMap::new() })
            .listeners
            .insert(listener, entry);
        Added { listener, created }
    }

    /// Removes a listener. Returns true when this emptied and removed the registration.
    pub fn remove(&mut self, id: &str, listener: ListenerId) -> bool {
        let Some(registration) = self.registrations.get_mut(id) else {
            return false;
        };
        if let Some(entry) = registration.listeners.remove(&listener) {
            entry
                .active
                .store(false, Ordering::Release);
        }
        if registration.listeners.is_empty() {
            self.registrations.remove(id);
            return true;
        }
        false
    }

    pub fn contains(&self, id: &str) -> bool {
        self.registrations.contains_key(id)
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn listener_count(&self, id: &str) -> usize {
        self.registrations
            .get(id)
            .map_or(0, |r| r.listeners.len())
    }

    pub fn request(&self, id: &str) -> Option<GraphRequest> {
        self.registrations
            .get(id)
            .map(|r| r.request.clone())
    }

    /// Snapshot of the listeners of `id`, to be invoked after the lock is released.
    pub fn listeners(&self, id: &str) -> Vec<(Listener, Arc<AtomicBool>)> {
        self.registrations
            .get(id)
            .map(|r| {
                r.listeners
                    .values()
                    .map(|entry| (Arc::clone(&entry.callback), Arc::clone(&entry.active)))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Subscription ids with the request to resubscribe them.
    pub fn requests(&self) -> Vec<(String, GraphRequest)> {
        self.registrations
            .iter()
            .map(|(id, r)| (id.clone(), r.request.clone()))
            .collect()
    }
}

/// Invokes the listeners of a snapshot that are still attached.
pub(crate) fn notify(listeners: &[(Listener, Arc<AtomicBool>)], event: &SubscriptionEvent) {
    for (callback, active) in listeners {
        if active.load(Ordering::Acquire) {
            callback(event);
        }
    }
}

/// Keeps one listener attached to a subscription.
///
/// Dropping the handle detaches the listener, like [`SubscriptionHandle::unsubscribe`].
#[must_use = "dropping the handle cancels the subscription"]
pub struct SubscriptionHandle {
    id: String,
    listener: ListenerId,
    registry: Arc<Mutex<Registry>>,
    commands: Option<mpsc::UnboundedSender<Command>>,
}

impl SubscriptionHandle {
    pub(crate) fn new(
        id: String,
        listener: ListenerId,
        registry: Arc<Mutex<Registry>>,
        commands: mpsc::UnboundedSender<Command>,
    ) -> Self {
        Self { id, listener, registry, commands: Some(commands) }
    }

    /// Subscription id shared by all identical subscriptions.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        let Some(commands) = self.commands.take() else {
            return;
        };
        let emptied = self
            .registry
            .lock()
            .remove(&self.id, self.listener);
        if emptied {
            debug!(id = %self.id, "SubscriptionReleased");
            // the driver may already be gone; nothing is left to tell it then
            let _ = commands.send(Command::Unsubscribe(self.id.clone()));
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("listener", &self.listener)
            .finish()
    }
}
