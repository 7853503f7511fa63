#![forbid(unsafe_code)]

//! The reactive store seam and the listener scope a page holds on it.

use std::fmt;
use std::rc::Rc;

use serde_json::Value;
use strand_core::{EventKind, MutationEvent};
use tracing::warn;

use crate::error::StoreError;

/// Handle of one store subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// Callback invoked for every mutation of a subscribed kind.
pub type StoreListener = Rc<dyn Fn(&MutationEvent)>;

/// A path-addressed JSON store that emits [`MutationEvent`]s.
///
/// Listeners are called synchronously from inside the mutating call and may
/// call back into the store.
pub trait Store {
    fn subscribe(&self, kind: EventKind, listener: StoreListener) -> ListenerId;

    fn unsubscribe(&self, id: ListenerId) -> Result<(), StoreError>;

    fn get(&self, path: &str) -> Option<Value>;

    /// Replace the value at `path`, emitting a change event.
    fn set(&self, path: &str, value: Value) -> Result<(), StoreError>;

    /// Delete `path` without emitting events.
    fn destroy_silently(&self, path: &str);

    /// Drop every loaded document without emitting events.
    fn unload_all(&self);
}

/// Store subscriptions acquired together and released together.
///
/// Dropping the set releases anything still held.
pub struct ListenerSet {
    store: Rc<dyn Store>,
    ids: Vec<ListenerId>,
}

impl ListenerSet {
    /// Subscribe one listener per kind in `kinds`, built by `make`.
    pub fn acquire(
        store: Rc<dyn Store>,
        kinds: &[EventKind],
        mut make: impl FnMut(EventKind) -> StoreListener,
    ) -> Self {
        let ids = kinds
            .iter()
            .map(|&kind| store.subscribe(kind, make(kind)))
            .collect();
        Self { store, ids }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    #[must_use]
    pub fn ids(&self) -> &[ListenerId] {
        &self.ids
    }

    /// Unsubscribe everything, returning the failures.
    ///
    /// Every handle is attempted; a failed release is not retried.
    pub fn release(&mut self) -> Vec<StoreError> {
        std::mem::take(&mut self.ids)
            .into_iter()
            .filter_map(|id| self.store.unsubscribe(id).err())
            .collect()
    }
}

impl Drop for ListenerSet {
    fn drop(&mut self) {
        let failures = self.release();
        if !failures.is_empty() {
            warn!(failures = failures.len(), "store listeners failed to release on drop");
        }
    }
}

impl fmt::Debug for ListenerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerSet").field("ids", &self.ids).finish()
    }
}
