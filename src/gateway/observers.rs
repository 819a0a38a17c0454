//! Usage: Session status fan-out to UI subscribers (navigation, route guards).

use crate::domain::session::SessionStatus;
use crate::shared::mutex_ext::MutexExt;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};

pub type SessionListener = Arc<dyn Fn(SessionStatus) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    listeners: Vec<(u64, SessionListener)>,
}

/// Transitions waiting for delivery, in the order they happened.
#[derive(Default)]
struct Outbox {
    queue: VecDeque<SessionStatus>,
    draining: bool,
}

#[derive(Clone, Default)]
pub struct SessionObservers {
    registry: Arc<Mutex<Registry>>,
    outbox: Arc<Mutex<Outbox>>,
}

impl SessionObservers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener`; it stays registered until the returned
    /// [`Subscription`] is dropped or unsubscribed.
    pub fn subscribe(
        &self,
        listener: impl Fn(SessionStatus) + Send + Sync + 'static,
    ) -> Subscription {
        let mut guard = self.registry.lock_or_recover();
        guard.next_id += 1;
        let id = guard.next_id;
        guard.listeners.push((id, Arc::new(listener)));
        Subscription {
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    pub fn listener_count(&self) -> usize {
        self.registry.lock_or_recover().listeners.len()
    }

    /// Queue `status` and deliver everything queued.
    pub fn notify(&self, status: SessionStatus) {
        self.enqueue(status);
        self.flush();
    }

    /// Record a transition. Called under the state machine's transition lock,
    /// which fixes the delivery order.
    pub(crate) fn enqueue(&self, status: SessionStatus) {
        self.outbox.lock_or_recover().queue.push_back(status);
    }

    /// Deliver queued transitions. Must be called without the transition lock
    /// held, so listeners may call back into the state machine.
    ///
    /// One caller drains at a time. A flush that finds another drain running
    /// (on another thread, or re-entered from a listener) returns at once and
    /// its transitions are delivered by that drain, after the ones before them.
    pub(crate) fn flush(&self) {
        {
            let mut outbox = self.outbox.lock_or_recover();
            if outbox.draining {
                return;
            }
            outbox.draining = true;
        }
        let mut drain = DrainGuard {
            outbox: &self.outbox,
            finished: false,
        };

        loop {
            let next = {
                let mut outbox = self.outbox.lock_or_recover();
                let next = outbox.queue.pop_front();
                // Released under the same lock that saw the queue empty, so a
                // concurrent enqueue either lands before this or drains itself.
                if next.is_none() {
                    outbox.draining = false;
                }
                next
            };
            match next {
                Some(status) => self.deliver(status),
                None => {
                    drain.finished = true;
                    return;
                }
            }
        }
    }

    fn deliver(&self, status: SessionStatus) {
        // The registry lock is released before listeners run, so a listener
        // may subscribe or unsubscribe.
        let listeners: Vec<SessionListener> = self
            .registry
            .lock_or_recover()
            .listeners
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        tracing::debug!(status = %status, listeners = listeners.len(), "session status changed");
        for listener in listeners {
            listener(status);
        }
    }
}

/// Releases the drain if a listener panics mid-delivery.
struct DrainGuard<'a> {
    outbox: &'a Mutex<Outbox>,
    finished: bool,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.outbox.lock_or_recover().draining = false;
        }
    }
}

#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    id: u64,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry
                .lock_or_recover()
                .listeners
                .retain(|(id, _)| *id != self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
