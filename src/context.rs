//! The per-request execution context.
//!
//! A [`Context`] is an explicit isolation boundary. Work that belongs to a
//! request runs through it, either as the request's continuation
//! ([`Context::run`]) or as a tracked child task ([`Context::spawn`]), and
//! every failure of that work, returned error or panic, is reported back to
//! the context's error traps. Nothing relies on a process-global error hook:
//! attribution is the explicit fan-in of each child onto its parent.
//!
//! ```text
//! Context::run(proceed) ──► task ─┬─ Ok(())        → nothing
//!                                 ├─ Err(e)        → report(Failed(e))
//!                                 └─ panic         → report(Panicked(msg))
//!
//! Context::spawn(child) ──► task ── same three outcomes, same report
//! Reporter::report(e)  ───────────► report(Failed(e))   (callback-style code)
//!
//! report(err) ──► error traps (Listeners<TrappedError>)
//!             └─► no trap attached → logged as unattributed
//! ```
//!
//! Both `run` and `spawn` schedule onto the tokio runtime instead of polling
//! in place, so traps registered before the call are active before any of
//! the work executes. Calling them outside a runtime panics, exactly like
//! `tokio::spawn`.
//!
//! Ownership runs one way: in-flight tasks own the context, the context owns
//! its traps, and the traps may own the request's handles. Handles and
//! reporters only point back weakly. Once the last task of a request ends,
//! the context and everything it kept alive are dropped.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{Instrument, Span, debug, error, info_span};

use crate::error::{BoxError, TrappedError};
use crate::handle::{Bindable, HandleId};
use crate::listeners::{ListenerId, Listeners};

static NEXT_CONTEXT: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a [`Context`]. Displays as `ctx-<n>`.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ContextId(u64);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// Lifecycle of a request's context.
///
/// ```text
/// Created → Bound → Running → { Completed | Errored } → CleanedUp
/// ```
///
/// `CleanedUp` is terminal: once reached, no further transition is recorded.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum State {
    Created,
    Bound,
    Running,
    Completed,
    Errored,
    CleanedUp,
}

/// A cheaply clonable handle to one request's execution context.
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

struct Inner {
    id: ContextId,
    span: Span,
    state: watch::Sender<State>,
    entered: AtomicBool,
    exited: AtomicBool,
    members: Mutex<Vec<HandleId>>,
    errors: Listeners<TrappedError>,
}

impl Context {
    pub fn new() -> Self {
        let id = ContextId(NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed));
        let (state, _) = watch::channel(State::Created);
        Self {
            inner: Arc::new(Inner {
                id,
                span: info_span!("request", context = %id),
                state,
                entered: AtomicBool::new(false),
                exited: AtomicBool::new(false),
                members: Mutex::new(Vec::new()),
                errors: Listeners::new(),
            }),
        }
    }

    pub fn id(&self) -> ContextId {
        self.inner.id
    }

    pub fn state(&self) -> State {
        *self.inner.state.borrow()
    }

    /// The span every task run through this context is instrumented with.
    pub fn span(&self) -> &Span {
        &self.inner.span
    }

    /// Resolves once the context reaches [`State::CleanedUp`].
    pub async fn closed(&self) {
        let mut rx = self.inner.state.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = rx.wait_for(|state| *state == State::CleanedUp).await;
    }

    /// Records a state transition. Ignored once `CleanedUp` is reached.
    pub(crate) fn advance(&self, next: State) {
        let changed = self.inner.state.send_if_modified(|state| {
            if *state == State::CleanedUp || *state == next {
                return false;
            }
            *state = next;
            true
        });
        if changed {
            debug!(context = %self.id(), state = ?next, "context state changed");
        }
    }

    // ── Membership ───────────────────────────────────────────────────────────

    /// Binds `handle` to this context.
    ///
    /// Returns `false` if the handle is already bound (to this or any other
    /// context).
    pub fn add(&self, handle: &impl Bindable) -> bool {
        if !handle.binding().bind(self) {
            return false;
        }
        self.members().push(handle.handle_id());
        debug!(context = %self.id(), handle = %handle.handle_id(), "handle bound");
        true
    }

    /// Unbinds `handle`. Returns `false` if it was not bound to this context.
    pub fn remove(&self, handle: &impl Bindable) -> bool {
        if !handle.binding().unbind(self) {
            return false;
        }
        let id = handle.handle_id();
        self.members().retain(|member| *member != id);
        debug!(context = %self.id(), handle = %id, "handle unbound");
        true
    }

    /// Number of handles currently bound.
    pub fn member_count(&self) -> usize {
        self.members().len()
    }

    fn members(&self) -> MutexGuard<'_, Vec<HandleId>> {
        self.inner.members.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Error traps ──────────────────────────────────────────────────────────

    /// Attaches an error trap.
    pub fn on_error(
        &self,
        handler: impl Fn(&TrappedError) + Send + Sync + 'static,
    ) -> ListenerId {
        self.inner.errors.on(handler)
    }

    /// Detaches an error trap. Returns `false` if it was not attached.
    pub fn remove_error_listener(&self, id: ListenerId) -> bool {
        self.inner.errors.remove(id)
    }

    pub fn error_listener_count(&self) -> usize {
        self.inner.errors.len()
    }

    /// Delivers `err` to every attached error trap.
    ///
    /// Returns whether any trap received it. An error nobody traps is logged
    /// as unattributed and otherwise dropped.
    pub fn report(&self, err: TrappedError) -> bool {
        let fired = self.inner.errors.emit(&err);
        if fired == 0 {
            unattributed(Some(self.id()), &err);
        }
        fired > 0
    }

    /// A weak reporter for callback-style code that cannot hold the context.
    pub fn reporter(&self) -> Reporter {
        Reporter { ctx: self.downgrade() }
    }

    pub(crate) fn downgrade(&self) -> WeakContext {
        WeakContext { id: self.id(), inner: Arc::downgrade(&self.inner) }
    }

    // ── Enter / exit ─────────────────────────────────────────────────────────

    /// Marks the context entered. Only the first call returns `true`.
    pub fn enter(&self) -> bool {
        if self.inner.entered.swap(true, Ordering::AcqRel) {
            debug!(context = %self.id(), "context already entered");
            return false;
        }
        debug!(context = %self.id(), "context entered");
        true
    }

    /// Exits the context and moves it to [`State::CleanedUp`].
    ///
    /// Only the first call has any effect; later calls return `false`.
    pub fn exit(&self) -> bool {
        if self.inner.exited.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.advance(State::CleanedUp);
        debug!(context = %self.id(), "context exited");
        true
    }

    pub fn is_exited(&self) -> bool {
        self.inner.exited.load(Ordering::Acquire)
    }

    // ── Execution ────────────────────────────────────────────────────────────

    /// Runs the request's continuation inside this context.
    ///
    /// The future is spawned, not polled in place. An `Err` or a panic is
    /// reported to the error traps.
    pub fn run<F, E>(&self, fut: F) -> JoinHandle<()>
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<BoxError>,
    {
        self.advance(State::Running);
        let ctx = self.clone();
        tokio::spawn(
            async move {
                if let Err(err) = settle(fut).await {
                    ctx.report(err);
                }
            }
            .instrument(self.inner.span.clone()),
        )
    }

    /// Spawns a child task whose failure is attributed to this context.
    ///
    /// Resolves to `Some(value)` on success and `None` once a failure has been
    /// reported.
    pub fn spawn<F, T, E>(&self, fut: F) -> JoinHandle<Option<T>>
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Into<BoxError>,
    {
        let ctx = self.clone();
        tokio::spawn(
            async move {
                match settle(fut).await {
                    Ok(value) => Some(value),
                    Err(err) => {
                        ctx.report(err);
                        None
                    }
                }
            }
            .instrument(self.inner.span.clone()),
        )
    }
}

impl Default for Context {
    fn default() -> Self { Self::new() }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("members", &self.member_count())
            .field("error_listeners", &self.error_listener_count())
            .finish()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if !self.exited.load(Ordering::Acquire) {
            debug!(context = %self.id, "context dropped without exiting");
        }
    }
}

// ── Reporter ─────────────────────────────────────────────────────────────────

/// Reports failures to a context without keeping it alive.
///
/// Hand one to timer callbacks, completion handlers or threads that outlive
/// the async call stack. Reports made after the context is gone are logged as
/// unattributed.
#[derive(Clone, Debug)]
pub struct Reporter {
    ctx: WeakContext,
}

impl Reporter {
    pub fn context_id(&self) -> ContextId {
        self.ctx.id()
    }

    /// Reports `err` to the context. Returns whether a trap received it.
    pub fn report(&self, err: impl Into<BoxError>) -> bool {
        let err = TrappedError::failed(err);
        match self.ctx.upgrade() {
            Some(ctx) => ctx.report(err),
            None => {
                unattributed(Some(self.ctx.id()), &err);
                false
            }
        }
    }
}

/// A non-owning reference to a [`Context`].
///
/// Handles and teardown state point back at their context through this, so
/// only in-flight work keeps a context alive.
#[derive(Clone, Debug)]
pub(crate) struct WeakContext {
    id: ContextId,
    inner: Weak<Inner>,
}

impl WeakContext {
    pub(crate) fn id(&self) -> ContextId {
        self.id
    }

    pub(crate) fn upgrade(&self) -> Option<Context> {
        self.inner.upgrade().map(|inner| Context { inner })
    }
}

// ── Detached work ────────────────────────────────────────────────────────────

/// Spawns work that belongs to no context. Failures are only logged.
pub(crate) fn spawn_detached<F, T, E>(fut: F) -> JoinHandle<Option<T>>
where
    F: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Into<BoxError>,
{
    tokio::spawn(async move {
        match settle(fut).await {
            Ok(value) => Some(value),
            Err(err) => {
                unattributed(None, &err);
                None
            }
        }
    })
}

/// Drives `fut` to completion behind a panic boundary.
async fn settle<F, T, E>(fut: F) -> Result<T, TrappedError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<BoxError>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(TrappedError::failed(err)),
        Err(payload) => Err(TrappedError::panicked(payload)),
    }
}

fn unattributed(context: Option<ContextId>, err: &TrappedError) {
    match context {
        Some(id) => error!(context = %id, error = %err, "unattributed error: no trap attached"),
        None => error!(error = %err, "unattributed error: raised outside any context"),
    }
}
