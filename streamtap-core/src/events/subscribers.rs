//! ## streamtap-core::events::subscribers
//! **Ordered subscriber list**
//!
//! The list is generic over the event type, so decoded messages and raw
//! stream chunks fan out through the same machinery.
//!
//! Publishing clones the current list before invoking anyone, so a callback
//! that subscribes or unsubscribes while an event is in flight neither drops
//! nor duplicates that event. A panicking subscriber is logged and skipped;
//! the remaining subscribers still receive the event.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

use super::{ConnectionEvent, MessageEvent};

pub type Subscriber<E = MessageEvent> = Arc<dyn Fn(&E) + Send + Sync>;

/// Ids are unique across every list in the process, so one handle can be
/// offered to several lists when unsubscribing.
static NEXT_ID: AtomicU64 = AtomicU64::new(0);

/// Handle returned by [`SubscriberList::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Ordered callbacks for one event type.
pub struct SubscriberList<E = MessageEvent> {
    entries: RwLock<Vec<(SubscriptionId, Subscriber<E>)>>,
}

impl<E> Default for SubscriberList<E> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }
}

impl<E: ConnectionEvent> SubscriberList<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = SubscriptionId(NEXT_ID.fetch_add(1, Ordering::Relaxed));
        self.entries.write().push((id, Arc::new(callback)));
        id
    }

    /// Returns `false` if `id` was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|(existing, _)| *existing != id);
        entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Delivers `event` to every subscriber in subscription order. Returns the
    /// number of subscribers that completed without panicking.
    pub fn publish(&self, event: &E) -> usize {
        let snapshot: Vec<Subscriber<E>> = self
            .entries
            .read()
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();

        let mut delivered = 0;
        for callback in snapshot {
            match panic::catch_unwind(AssertUnwindSafe(|| callback(event))) {
                Ok(()) => delivered += 1,
                Err(_) => warn!(
                    connection = %event.connection(),
                    direction = %event.direction(),
                    kind = E::KIND,
                    "Subscriber panicked; skipping"
                ),
            }
        }
        delivered
    }
}

impl<E> std::fmt::Debug for SubscriberList<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberList")
            .field("len", &self.entries.read().len())
            .finish()
    }
}
