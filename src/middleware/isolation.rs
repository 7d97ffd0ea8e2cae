//! Per-request isolation.
//!
//! # Lifecycle of one request
//!
//! ```text
//! handle(req, res, next)
//!   │  Context::new()                        Created
//!   │  ctx.add(req), ctx.add(res)            Bound
//!   │  res.on_finish(teardown)               completion trap
//!   │  ctx.on_error(trap)                    error trap
//!   │  ctx.enter(); ctx.run(next(None))      Running
//!   ▼
//!   ├─ res finishes ──► teardown             Completed → CleanedUp
//!   └─ error trapped ─► teardown             Errored   → CleanedUp
//!                       sink.error(msg)
//!                       next(Some(err))      downstream error handling
//!                       policy → terminate?
//! ```
//!
//! Teardown removes both traps, unbinds both handles and exits the context.
//! It runs exactly once: whichever of completion and error arrives second
//! finds it done and does nothing.
//!
//! The context's error trap owns the teardown and the teardown owns the
//! handles; the teardown only points back at the context weakly. A request
//! whose work has ended without finishing or failing therefore drops its
//! context, its traps and its handles together.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use futures::FutureExt;
use tokio::runtime::Handle;
use tracing::{Instrument, debug, error, info, info_span};

use crate::config::Config;
use crate::context::{Context, ContextId, State, WeakContext};
use crate::error::{TrappedError, panic_message};
use crate::listeners::ListenerId;
use crate::next::Next;
use crate::policy::{Action, FatalPolicy, SignalTerminator, Terminator};
use crate::request::Request;
use crate::response::Response;
use crate::sink::{ErrorSink, TracingSink};

/// The isolation middleware.
///
/// Cheap to clone; share one instance across every connection.
///
/// ```rust,no_run
/// use cordon::{Action, Next, Request, Response, StderrSink};
/// use cordon::middleware::Isolation;
///
/// # async fn demo() {
/// let isolation = Isolation::new()
///     .with_sink(StderrSink)
///     .with_policy(Action::LogOnly);
///
/// let req = Request::get("/");
/// let res = Response::new();
/// let next = Next::new({
///     let res = res.clone();
///     move |err| {
///         let res = res.clone();
///         async move {
///             if err.is_none() {
///                 res.finish();
///             }
///         }
///     }
/// });
///
/// isolation.handle(&req, &res, next).closed().await;
/// # }
/// ```
#[derive(Clone)]
pub struct Isolation {
    sink: Arc<dyn ErrorSink>,
    policy: Arc<dyn FatalPolicy>,
    terminator: Arc<dyn Terminator>,
}

impl Isolation {
    /// Default configuration: report through `tracing`, terminate the process
    /// after a trapped error.
    pub fn new() -> Self {
        Self::from_config(&Config::default())
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            sink: Arc::new(TracingSink),
            policy: Arc::new(config.fatal_action),
            terminator: Arc::new(SignalTerminator),
        }
    }

    /// Replaces the error sink.
    pub fn with_sink(mut self, sink: impl ErrorSink) -> Self {
        self.sink = Arc::new(sink);
        self
    }

    /// Replaces the error sink if `logger` is set; keeps the current one
    /// otherwise.
    pub fn with_logger(mut self, logger: Option<Arc<dyn ErrorSink>>) -> Self {
        if let Some(sink) = logger {
            self.sink = sink;
        }
        self
    }

    /// Replaces the fatal-error policy. A bare [`Action`] is a fixed policy.
    pub fn with_policy(mut self, policy: impl FatalPolicy) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    /// Replaces what carries out [`Action::TerminateProcess`].
    pub fn with_terminator(mut self, terminator: impl Terminator) -> Self {
        self.terminator = Arc::new(terminator);
        self
    }

    /// Runs one request inside a fresh context.
    ///
    /// `next` is invoked with `None` inside the context on a later turn of
    /// the runtime, and with `Some(err)` if an error is trapped. The returned
    /// context is for observation only; dropping it changes nothing.
    ///
    /// Must be called from within a tokio runtime.
    pub fn handle(&self, req: &Request, res: &Response, next: Next) -> Context {
        let ctx = Context::new();
        ctx.add(req);
        ctx.add(res);
        ctx.advance(State::Bound);

        let teardown = Arc::new(Teardown {
            done: AtomicBool::new(false),
            ctx: ctx.downgrade(),
            req: req.clone(),
            res: res.clone(),
            error_trap: OnceLock::new(),
            finish_trap: OnceLock::new(),
        });

        // The response must not own its teardown: teardown owns the response.
        let finish_trap = {
            let teardown = Arc::downgrade(&teardown);
            res.on_finish(move |_| {
                if let Some(teardown) = teardown.upgrade() {
                    teardown.run(State::Completed);
                }
            })
        };
        let _ = teardown.finish_trap.set(finish_trap);

        let error_trap = {
            let teardown = Arc::clone(&teardown);
            let recovery = Recovery {
                sink: Arc::clone(&self.sink),
                policy: Arc::clone(&self.policy),
                terminator: Arc::clone(&self.terminator),
                runtime: Handle::current(),
                next: next.clone(),
            };
            ctx.on_error(move |err| {
                if !teardown.run(State::Errored) {
                    error!(
                        context = %teardown.ctx.id(),
                        error = %err,
                        "error raced request completion; not forwarded"
                    );
                    return;
                }
                recovery.recover(teardown.ctx.id(), err.clone());
            })
        };
        let _ = teardown.error_trap.set(error_trap);

        ctx.enter();
        ctx.run(async move { next.call(None).await });
        ctx
    }
}

impl Default for Isolation {
    fn default() -> Self { Self::new() }
}

impl fmt::Debug for Isolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Isolation").finish_non_exhaustive()
    }
}

// ── Teardown ─────────────────────────────────────────────────────────────────

/// Everything one request registered, and the flag that makes removing it
/// happen once.
struct Teardown {
    done: AtomicBool,
    ctx: WeakContext,
    req: Request,
    res: Response,
    error_trap: OnceLock<ListenerId>,
    finish_trap: OnceLock<ListenerId>,
}

impl Teardown {
    /// Returns `false` if teardown already ran.
    fn run(&self, outcome: State) -> bool {
        if self.done.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Some(id) = self.finish_trap.get() {
            self.res.remove_finish_listener(*id);
        }
        // Both traps run while something still holds the context, so this
        // only misses when the context is being dropped concurrently.
        let Some(ctx) = self.ctx.upgrade() else {
            return true;
        };
        ctx.advance(outcome);
        if let Some(id) = self.error_trap.get() {
            ctx.remove_error_listener(*id);
        }
        ctx.remove(&self.req);
        ctx.remove(&self.res);
        ctx.exit();
        debug!(context = %ctx.id(), outcome = ?outcome, "request context cleaned up");
        true
    }
}

// ── Recovery ─────────────────────────────────────────────────────────────────

/// The error path: report, forward downstream, apply the fatal policy.
struct Recovery {
    sink: Arc<dyn ErrorSink>,
    policy: Arc<dyn FatalPolicy>,
    terminator: Arc<dyn Terminator>,
    runtime: Handle,
    next: Next,
}

impl Recovery {
    fn recover(&self, context: ContextId, err: TrappedError) {
        self.sink.error(&format!("{context}: trapped error: {err}"));

        let action = self.policy.decide(&err);
        let next = self.next.clone();
        let terminator = Arc::clone(&self.terminator);

        self.runtime.spawn(
            async move {
                let forwarded = AssertUnwindSafe(async { next.call(Some(err.clone())).await })
                    .catch_unwind()
                    .await;
                match forwarded {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!(error = %e, "pipeline error handling failed"),
                    Err(payload) => error!(
                        panic = %panic_message(payload.as_ref()),
                        "pipeline error handling panicked"
                    ),
                }

                match action {
                    Action::TerminateProcess => {
                        if let Err(e) = terminator.terminate(&err) {
                            error!("failed to terminate process: {e}");
                        }
                    }
                    Action::LogOnly => info!("fatal action is log-only, process keeps serving"),
                }
            }
            .instrument(info_span!("recover", context = %context)),
        );
    }
}
