//! Listener registry backing every trap.
//!
//! A [`Listeners`] holds the handlers attached to one signal (a context's
//! error signal, a response's finished signal). Registration hands back a
//! [`ListenerId`]; removal by id is idempotent and reports whether anything
//! was actually removed, so double-removal can never turn into a runtime
//! error.
//!
//! `emit` snapshots the handlers and releases the lock before calling them.
//! A handler is therefore free to remove itself, or any other listener, while
//! it runs.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type Slot<T> = Arc<dyn Fn(&T) + Send + Sync + 'static>;

/// Identifies one registration inside a [`Listeners`] registry.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Handlers attached to a single signal carrying a `T`.
pub struct Listeners<T> {
    next_id: AtomicU64,
    slots: Mutex<Vec<(ListenerId, Slot<T>)>>,
}

impl<T> Listeners<T> {
    pub fn new() -> Self {
        Self { next_id: AtomicU64::new(1), slots: Mutex::new(Vec::new()) }
    }

    /// Attaches `handler` and returns the id needed to detach it.
    pub fn on(&self, handler: impl Fn(&T) + Send + Sync + 'static) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().push((id, Arc::new(handler)));
        id
    }

    /// Detaches the listener. Returns `false` if it was not attached.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut slots = self.lock();
        match slots.iter().position(|(slot_id, _)| *slot_id == id) {
            Some(index) => {
                slots.remove(index);
                true
            }
            None => false,
        }
    }

    /// Calls every attached handler with `value`, in registration order.
    /// Returns how many handlers were called.
    pub fn emit(&self, value: &T) -> usize {
        let snapshot: Vec<Slot<T>> =
            self.lock().iter().map(|(_, handler)| Arc::clone(handler)).collect();
        for handler in &snapshot {
            handler(value);
        }
        snapshot.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(ListenerId, Slot<T>)>> {
        // A panicking listener never runs under this lock, so the data behind
        // a poisoned mutex is still consistent.
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> Default for Listeners<T> {
    fn default() -> Self { Self::new() }
}

impl<T> fmt::Debug for Listeners<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners").field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn emit_reaches_every_listener_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let listeners = Listeners::<u32>::new();
        for tag in ["a", "b"] {
            let seen = Arc::clone(&seen);
            listeners.on(move |v| seen.lock().unwrap().push(format!("{tag}{v}")));
        }

        assert_eq!(listeners.emit(&7), 2);
        assert_eq!(*seen.lock().unwrap(), ["a7", "b7"]);
    }

    #[test]
    fn removal_is_idempotent() {
        let listeners = Listeners::<()>::new();
        let id = listeners.on(|_| {});

        assert!(listeners.remove(id));
        assert!(!listeners.remove(id));
        assert!(listeners.is_empty());
        assert_eq!(listeners.emit(&()), 0);
    }

    #[test]
    fn a_listener_can_detach_itself_while_emitting() {
        let listeners = Arc::new(Listeners::<()>::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let own_id = Arc::new(Mutex::new(None));

        let id = {
            let registry = Arc::clone(&listeners);
            let calls = Arc::clone(&calls);
            let own_id = Arc::clone(&own_id);
            listeners.on(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                if let Some(id) = *own_id.lock().unwrap() {
                    registry.remove(id);
                }
            })
        };
        *own_id.lock().unwrap() = Some(id);

        listeners.emit(&());
        listeners.emit(&());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(listeners.len(), 0);
    }
}
