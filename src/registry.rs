//! Reference-counted room memberships, replayed on every reconnect.
//!
//! DESIGN
//! ======
//! The server forgets room membership whenever the push channel drops, so
//! the client is the source of truth. Each topic carries a count of
//! interested consumers; only the 0→1 and 1→0 transitions talk to the
//! server. A separate order list remembers first-join order for replay.
//!
//! Lock order is registry → connection. The connection never calls back into
//! the registry while holding its own lock, and `Connected` is emitted with
//! no lock held.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::{debug, info};

use crate::connection::ConnectionManager;
use crate::events::{EventBus, EventKind, Listener};
use crate::frame::PushFrame;

#[derive(Default)]
struct Topics {
    counts: HashMap<String, NonZeroUsize>,
    /// Tracked topics in first-join order.
    order: Vec<String>,
}

pub struct TopicRegistry {
    connection: Arc<ConnectionManager>,
    bus: Arc<EventBus>,
    topics: Mutex<Topics>,
    on_connected: Mutex<Option<Listener>>,
}

impl TopicRegistry {
    #[must_use]
    pub fn new(connection: Arc<ConnectionManager>, bus: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self {
            connection,
            bus,
            topics: Mutex::new(Topics::default()),
            on_connected: Mutex::new(None),
        })
    }

    /// Replay tracked rooms on every `Connected`. Idempotent.
    pub fn attach(self: &Arc<Self>) {
        let mut slot = self.on_connected.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return;
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        let listener = self.bus.on(EventKind::Connected, move |_| {
            if let Some(registry) = weak.upgrade() {
                registry.replay();
            }
        });
        *slot = Some(listener);
    }

    pub fn detach(&self) {
        let listener = self.on_connected.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(listener) = listener {
            self.bus.off(EventKind::Connected, &listener);
        }
    }

    /// Add one reference to `topic`. Returns the new count.
    ///
    /// The first reference sends a join frame when Connected; otherwise the
    /// join waits for the next replay.
    pub fn join(&self, topic: &str) -> usize {
        let mut topics = self.lock();
        match topics.counts.get_mut(topic) {
            Some(count) => {
                *count = count.saturating_add(1);
                count.get()
            }
            None => {
                topics.counts.insert(topic.to_owned(), NonZeroUsize::MIN);
                topics.order.push(topic.to_owned());
                if self.connection.send(PushFrame::join(topic)) {
                    info!(%topic, "room joined");
                } else {
                    debug!(%topic, "room join deferred until connected");
                }
                1
            }
        }
    }

    /// Drop one reference to `topic`. Returns the remaining count.
    ///
    /// The last reference removes the topic and sends a leave frame when
    /// Connected. Untracked topics are ignored.
    pub fn leave(&self, topic: &str) -> usize {
        let mut topics = self.lock();
        let Some(count) = topics.counts.get(topic).copied() else {
            return 0;
        };
        if let Some(remaining) = NonZeroUsize::new(count.get() - 1) {
            topics.counts.insert(topic.to_owned(), remaining);
            return remaining.get();
        }

        topics.counts.remove(topic);
        topics.order.retain(|t| t != topic);
        if self.connection.send(PushFrame::leave(topic)) {
            info!(%topic, "room left");
        }
        0
    }

    /// Send a join frame for every tracked topic, in first-join order.
    /// Returns how many frames were queued.
    pub fn replay(&self) -> usize {
        let topics = self.lock();
        let sent = topics
            .order
            .iter()
            .filter(|topic| self.connection.send(PushFrame::join(topic)))
            .count();
        if !topics.order.is_empty() {
            info!(sent, tracked = topics.order.len(), "rooms replayed");
        }
        sent
    }

    #[must_use]
    pub fn count(&self, topic: &str) -> usize {
        self.lock().counts.get(topic).map_or(0, |c| c.get())
    }

    /// Tracked topics in first-join order.
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        self.lock().order.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Topics> {
        self.topics.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
#[path = "registry_test.rs"]
mod tests;
