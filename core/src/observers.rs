//! Observer lists with staged notification.
//!
//! Callbacks are free to subscribe or cancel from within a notification:
//! `notify` snapshots the list first, so removals take effect on the next
//! event and additions never see the event being dispatched.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct ListInner<E> {
    entries: Mutex<Vec<(u64, Callback<E>)>>,
    next_id: AtomicU64,
}

/// A clonable, thread-safe list of callbacks for one event type.
pub struct ObserverList<E> {
    inner: Arc<ListInner<E>>,
}

impl<E> Clone for ObserverList<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E> Default for ObserverList<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> ObserverList<E> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ListInner {
                entries: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Adds a callback. Dropping the returned [`Subscription`] removes it.
    #[must_use = "dropping the subscription immediately unsubscribes"]
    pub fn subscribe(&self, callback: impl Fn(&E) + Send + Sync + 'static) -> Subscription
    where
        E: 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.entries.lock().push((id, Arc::new(callback)));
        let target = Arc::downgrade(&self.inner);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(inner) = target.upgrade() {
                    inner.entries.lock().retain(|(entry_id, _)| *entry_id != id);
                }
            })),
        }
    }

    /// Invokes every currently-registered callback with `event`.
    pub fn notify(&self, event: &E) {
        let snapshot: Vec<Callback<E>> = self
            .inner
            .entries
            .lock()
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        for callback in snapshot {
            callback(event);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle to a registered observer. Cancels on drop; use
/// [`Subscription::detach`] to keep the observer alive for the lifetime of
/// the list instead.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Removes the observer now.
    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    /// Leaves the observer registered permanently.
    pub fn detach(mut self) {
        self.cancel.take();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}
