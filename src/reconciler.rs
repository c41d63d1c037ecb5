//! Optimistic list mutations reconciled against server results.
//!
//! ARCHITECTURE
//! ============
//! A `Reconciler` holds one ordered list of entries, each either a tentative
//! `Pending` payload keyed by a client-generated `TempId` or a `Confirmed`
//! canonical item keyed by its server id.
//!
//! ```text
//! pending:   TempId  -> (Slot, P)
//! confirmed: ServerId -> (Slot, T)
//! order:     Slot -> key          (BTreeMap, iteration = display order)
//! ```
//!
//! A `Slot` is `(seq, sub)`. New entries take the next `seq` with `sub = 0`.
//! When a pending entry resolves into k items they take its `seq` with
//! `sub = 0..k`, so they land exactly where the pending entry was without
//! renumbering neighbours.
//!
//! DESIGN
//! ======
//! - One submission in flight per list. A second `submit` before the first
//!   is confirmed or failed returns `ClientError::Busy`.
//! - Every mutation publishes exactly one snapshot on a `watch` channel
//!   while the book is locked, so observers never see a half-applied
//!   reconciliation and snapshots are published in mutation order.
//! - Pushed items are matched to a pending entry by correlation id when the
//!   server echoes one; otherwise they replace an entry with the same server
//!   id in place or are appended.
//! - If a push resolved the pending entry before the direct response
//!   arrived, `confirm` replaces matching ids in place and appends the rest.
//!   Last server response wins.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

use crate::error::ClientError;

/// A server-confirmed list item.
pub trait Canonical: Clone {
    /// Stable server-assigned identity.
    fn server_id(&self) -> &str;

    /// The client temp id the server echoed back, when it supports that.
    fn correlation_id(&self) -> Option<&str> {
        None
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TempId(String);

impl TempId {
    fn generate() -> Self {
        Self(format!("tmp-{}", Uuid::new_v4()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TempId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ListEntry<P, T> {
    Pending { temp_id: TempId, payload: P },
    Confirmed(T),
}

impl<P, T> ListEntry<P, T> {
    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending { .. })
    }

    #[must_use]
    pub fn confirmed(&self) -> Option<&T> {
        match self {
            Self::Confirmed(item) => Some(item),
            Self::Pending { .. } => None,
        }
    }
}

// =============================================================================
// BOOK
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Slot {
    seq: u64,
    sub: u32,
}

enum EntryKey {
    Pending(TempId),
    Confirmed(String),
}

struct Book<P, T> {
    pending: HashMap<TempId, (Slot, P)>,
    confirmed: HashMap<String, (Slot, T)>,
    order: BTreeMap<Slot, EntryKey>,
    next_seq: u64,
    in_flight: Option<TempId>,
}

impl<P, T> Default for Book<P, T> {
    fn default() -> Self {
        Self {
            pending: HashMap::new(),
            confirmed: HashMap::new(),
            order: BTreeMap::new(),
            next_seq: 0,
            in_flight: None,
        }
    }
}

impl<P: Clone, T: Canonical> Book<P, T> {
    fn next_slot(&mut self) -> Slot {
        let slot = Slot { seq: self.next_seq, sub: 0 };
        self.next_seq += 1;
        slot
    }

    fn entries(&self) -> Vec<ListEntry<P, T>> {
        self.order
            .values()
            .filter_map(|key| match key {
                EntryKey::Pending(temp_id) => self.pending.get(temp_id).map(|(_, payload)| ListEntry::Pending {
                    temp_id: temp_id.clone(),
                    payload: payload.clone(),
                }),
                EntryKey::Confirmed(id) => self.confirmed.get(id).map(|(_, item)| ListEntry::Confirmed(item.clone())),
            })
            .collect()
    }

    fn take_pending(&mut self, temp_id: &TempId) -> Option<Slot> {
        let (slot, _) = self.pending.remove(temp_id)?;
        self.order.remove(&slot);
        Some(slot)
    }

    fn remove_confirmed(&mut self, id: &str) {
        if let Some((slot, _)) = self.confirmed.remove(id) {
            self.order.remove(&slot);
        }
    }

    fn put(&mut self, slot: Slot, item: T) {
        let id = item.server_id().to_owned();
        self.order.insert(slot, EntryKey::Confirmed(id.clone()));
        self.confirmed.insert(id, (slot, item));
    }

    /// Lay `items` out where the pending entry at `at` was.
    fn fill(&mut self, at: Slot, items: Vec<T>) {
        for (sub, item) in (0_u32..).zip(items) {
            self.remove_confirmed(item.server_id());
            self.put(Slot { seq: at.seq, sub }, item);
        }
    }

    /// Replace an existing item in place, or append it.
    fn upsert(&mut self, item: T) {
        let existing = self.confirmed.get(item.server_id()).map(|(slot, _)| *slot);
        let slot = existing.unwrap_or_else(|| self.next_slot());
        self.put(slot, item);
    }

    fn pending_for(&self, correlation: &str) -> Option<TempId> {
        self.pending.keys().find(|t| t.as_str() == correlation).cloned()
    }
}

// =============================================================================
// RECONCILER
// =============================================================================

pub struct Reconciler<P, T> {
    book: Mutex<Book<P, T>>,
    snapshots: watch::Sender<Vec<ListEntry<P, T>>>,
}

impl<P: Clone, T: Canonical> Default for Reconciler<P, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Clone, T: Canonical> Reconciler<P, T> {
    #[must_use]
    pub fn new() -> Self {
        let (snapshots, _) = watch::channel(Vec::new());
        Self { book: Mutex::new(Book::default()), snapshots }
    }

    /// Append a pending entry for `payload` and return the updated list.
    ///
    /// # Errors
    ///
    /// [`ClientError::Busy`] while an earlier submission is unresolved.
    pub fn submit(&self, payload: P) -> Result<(TempId, Vec<ListEntry<P, T>>), ClientError> {
        let mut book = self.lock();
        if book.in_flight.is_some() {
            return Err(ClientError::Busy);
        }
        let temp_id = TempId::generate();
        let slot = book.next_slot();
        book.order.insert(slot, EntryKey::Pending(temp_id.clone()));
        book.pending.insert(temp_id.clone(), (slot, payload));
        book.in_flight = Some(temp_id.clone());
        debug!(%temp_id, "optimistic entry added");
        Ok((temp_id, self.publish(&book)))
    }

    /// Resolve `temp_id` with the server's canonical items.
    pub fn confirm(&self, temp_id: &TempId, items: Vec<T>) -> Vec<ListEntry<P, T>> {
        let mut book = self.lock();
        Self::release(&mut book, temp_id);
        if let Some(slot) = book.take_pending(temp_id) {
            book.fill(slot, items);
        } else {
            debug!(%temp_id, "pending entry already resolved; merging response");
            for item in items {
                book.upsert(item);
            }
        }
        self.publish(&book)
    }

    /// Discard `temp_id`, restoring the list to its pre-submit contents.
    pub fn fail(&self, temp_id: &TempId) -> Vec<ListEntry<P, T>> {
        let mut book = self.lock();
        Self::release(&mut book, temp_id);
        if book.take_pending(temp_id).is_some() {
            debug!(%temp_id, "optimistic entry rolled back");
        }
        self.publish(&book)
    }

    /// Merge an item that arrived on the push channel.
    pub fn apply_push(&self, item: T) -> Vec<ListEntry<P, T>> {
        let mut book = self.lock();
        let matched = item.correlation_id().and_then(|c| book.pending_for(c));
        match matched.and_then(|temp_id| book.take_pending(&temp_id)) {
            Some(slot) => book.fill(slot, vec![item]),
            None => book.upsert(item),
        }
        self.publish(&book)
    }

    /// Replace every confirmed entry, keeping pending ones after them.
    pub fn replace_all(&self, items: Vec<T>) -> Vec<ListEntry<P, T>> {
        let mut book = self.lock();
        let pending: Vec<(TempId, P)> = book
            .order
            .values()
            .filter_map(|key| match key {
                EntryKey::Pending(temp_id) => book.pending.get(temp_id).map(|(_, p)| (temp_id.clone(), p.clone())),
                EntryKey::Confirmed(_) => None,
            })
            .collect();

        book.order.clear();
        book.confirmed.clear();
        book.pending.clear();
        for item in items {
            book.upsert(item);
        }
        for (temp_id, payload) in pending {
            let slot = book.next_slot();
            book.order.insert(slot, EntryKey::Pending(temp_id.clone()));
            book.pending.insert(temp_id, (slot, payload));
        }
        self.publish(&book)
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<ListEntry<P, T>> {
        self.lock().entries()
    }

    /// Receiver that observes every published list.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Vec<ListEntry<P, T>>> {
        self.snapshots.subscribe()
    }

    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.lock().in_flight.is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().order.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().order.is_empty()
    }

    fn release(book: &mut Book<P, T>, temp_id: &TempId) {
        if book.in_flight.as_ref() == Some(temp_id) {
            book.in_flight = None;
        }
    }

    fn publish(&self, book: &Book<P, T>) -> Vec<ListEntry<P, T>> {
        let entries = book.entries();
        self.snapshots.send_replace(entries.clone());
        entries
    }

    fn lock(&self) -> MutexGuard<'_, Book<P, T>> {
        self.book.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
#[path = "reconciler_test.rs"]
mod tests;
