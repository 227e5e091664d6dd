use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use super::posting::Scope;
use super::types::{Event, EventType, downcast_arc};

/// A cached sticky event and the subscriptions it may be replayed to.
#[derive(Debug, Clone)]
pub(crate) struct StickyEntry {
    pub(crate) event: Arc<dyn Event>,
    pub(crate) scope: Scope,
    /// Position of the post that cached it
    pub(crate) seq: u64,
}

/// Last posted sticky event per concrete event type.
///
/// Targeted and untargeted posts share one slot per type: whichever came last wins.
#[derive(Debug, Default)]
pub(crate) struct StickyEventStore {
    entries: Mutex<HashMap<TypeId, StickyEntry>>,
    next_seq: AtomicU64,
}

impl StickyEventStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Caches `event`, returning the entry it replaced
    pub(crate) fn put(&self, event: Arc<dyn Event>, scope: Scope) -> Option<StickyEntry> {
        let key = event.event_type().id();
        let mut entries = self.entries.lock();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        entries.insert(key, StickyEntry { event, scope, seq })
    }

    pub(crate) fn get(&self, event_type: EventType) -> Option<Arc<dyn Event>> {
        self.entries
            .lock()
            .get(&event_type.id())
            .map(|entry| entry.event.clone())
    }

    pub(crate) fn get_typed<E: Event>(&self) -> Option<Arc<E>> {
        self.get(EventType::of::<E>()).and_then(downcast_arc::<E>)
    }

    pub(crate) fn remove(&self, event_type: EventType) -> Option<Arc<dyn Event>> {
        self.entries
            .lock()
            .remove(&event_type.id())
            .map(|entry| entry.event)
    }

    /// Removes the cached event of `E`'s type only if it equals `event`.
    pub(crate) fn remove_if_equals<E: Event + PartialEq>(&self, event: &E) -> bool {
        let mut entries = self.entries.lock();
        let key = TypeId::of::<E>();
        let equal = entries
            .get(&key)
            .and_then(|entry| entry.event.downcast_ref::<E>())
            .is_some_and(|cached| cached == event);
        if equal {
            entries.remove(&key);
        }
        equal
    }

    pub(crate) fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Snapshot of every cached entry, oldest post first
    pub(crate) fn entries(&self) -> Vec<StickyEntry> {
        let mut entries: Vec<StickyEntry> = self.entries.lock().values().cloned().collect();
        entries.sort_unstable_by_key(|entry| entry.seq);
        entries
    }
}
