//! Listener fan-out shared by workers and queues.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use crate::types::SenderId;

/// Receives events fired on an [`EventBus`].
///
/// Called synchronously on the firing task; implementations must not block.
pub trait Listener<E>: Send + Sync {
    fn handle_event(&self, event: &E, sender: SenderId);
}

impl<E, F> Listener<E> for F
where
    F: Fn(&E, SenderId) + Send + Sync,
{
    fn handle_event(&self, event: &E, sender: SenderId) {
        self(event, sender)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Registration<E> {
    id: ListenerId,
    listener: Weak<dyn Listener<E>>,
}

impl<E> Clone for Registration<E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            listener: self.listener.clone(),
        }
    }
}

/// Delivers events to listeners in registration order.
///
/// Listeners are held weakly: dropping the last `Arc` unregisters a listener
/// implicitly. Delivery iterates a snapshot, so a listener may add or remove
/// listeners while it is being notified; the change applies from the next event.
pub struct EventBus<E> {
    sender: SenderId,
    next_id: AtomicU64,
    listeners: Mutex<Vec<Registration<E>>>,
}

impl<E> EventBus<E> {
    pub fn new(sender: SenderId) -> Self {
        Self {
            sender,
            next_id: AtomicU64::new(0),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn sender(&self) -> SenderId {
        self.sender
    }

    pub fn add_listener<L>(&self, listener: &Arc<L>) -> ListenerId
    where
        L: Listener<E> + 'static,
    {
        let listener: Arc<dyn Listener<E>> = listener.clone();
        self.add_shared_listener(&listener)
    }

    pub fn add_shared_listener(&self, listener: &Arc<dyn Listener<E>>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.registrations().push(Registration {
            id,
            listener: Arc::downgrade(listener),
        });

        id
    }

    /// Returns whether the listener was registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.registrations();
        let before = listeners.len();
        listeners.retain(|registration| registration.id != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.registrations()
            .iter()
            .filter(|registration| registration.listener.strong_count() > 0)
            .count()
    }

    pub fn fire(&self, event: &E) {
        let snapshot: Vec<Registration<E>> = {
            let mut listeners = self.registrations();
            listeners.retain(|registration| registration.listener.strong_count() > 0);
            listeners.clone()
        };

        for registration in snapshot {
            if let Some(listener) = registration.listener.upgrade() {
                listener.handle_event(event, self.sender);
            }
        }
    }

    fn registrations(&self) -> std::sync::MutexGuard<'_, Vec<Registration<E>>> {
        // A listener panicking mid-delivery must not wedge the bus
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
