//! Handle identity and the context binding slot.
//!
//! Request and response handles both carry a [`Binding`]: the slot a
//! [`Context`] writes itself into on `add` and clears on `remove`. Anything
//! that reaches the context through a handle (spawned work, reporters) goes
//! through this slot, which is how failures get attributed to the right
//! request.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::context::{Context, WeakContext};

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a request or response handle.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct HandleId(u64);

impl HandleId {
    pub(crate) fn next() -> Self {
        Self(NEXT_HANDLE.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handle-{}", self.0)
    }
}

/// The context a handle is currently bound to, if any.
///
/// The slot holds the context weakly: a handle never keeps its context
/// alive, and a slot whose context is gone reads as unbound.
#[derive(Default)]
pub struct Binding(Mutex<Option<WeakContext>>);

impl Binding {
    pub(crate) fn get(&self) -> Option<Context> {
        self.slot().as_ref().and_then(WeakContext::upgrade)
    }

    /// Binds `ctx` unless a live context holds the slot. Returns whether it
    /// bound.
    pub(crate) fn bind(&self, ctx: &Context) -> bool {
        let mut slot = self.slot();
        if slot.as_ref().and_then(WeakContext::upgrade).is_some() {
            return false;
        }
        *slot = Some(ctx.downgrade());
        true
    }

    /// Clears the slot if it holds `ctx`. Returns whether it unbound.
    pub(crate) fn unbind(&self, ctx: &Context) -> bool {
        let mut slot = self.slot();
        match slot.as_ref() {
            Some(bound) if bound.id() == ctx.id() => {
                *slot = None;
                true
            }
            _ => false,
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<WeakContext>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get() {
            Some(ctx) => write!(f, "Binding({})", ctx.id()),
            None => f.write_str("Binding(unbound)"),
        }
    }
}

/// Something a [`Context`] can bind: it has an identity and a binding slot.
///
/// Implemented by [`Request`](crate::Request) and [`Response`](crate::Response).
pub trait Bindable {
    fn handle_id(&self) -> HandleId;

    #[doc(hidden)]
    fn binding(&self) -> &Binding;

    /// The context this handle is bound to, if any.
    fn context(&self) -> Option<Context> {
        self.binding().get()
    }
}
