//! The `proceed` continuation and its type erasure.
//!
//! The middleware hands control to the rest of the pipeline through a
//! [`Next`]. It is called once with `None` to run the pipeline, and, if an
//! error is trapped, once more with `Some(error)` so the pipeline's own error
//! handling can still produce a response.
//!
//! The chain from user code to the call the middleware makes:
//!
//! ```text
//! |err| async move { … }                     ← user writes this
//!        ↓ Next::new(f)
//! Arc::new(FnNext(f))                        ← heap-allocated wrapper
//!        ↓ stored as Arc<dyn ErasedNext>
//! next.call(None) / next.call(Some(err))     ← one vtable dispatch
//!        ↓
//! Box::pin(async { f(err).await.into_outcome() })  ← BoxFuture
//! ```

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::{BoxError, TrappedError};

/// A heap-allocated, type-erased future resolving to the pipeline outcome.
pub type BoxFuture = Pin<Box<dyn Future<Output = Result<(), BoxError>> + Send + 'static>>;

// ── IntoOutcome ──────────────────────────────────────────────────────────────

/// Conversion of a pipeline stage's return value into its outcome.
///
/// Lets continuations and stages return either `()` or any
/// `Result<(), E>` whose error converts into [`BoxError`].
pub trait IntoOutcome {
    fn into_outcome(self) -> Result<(), BoxError>;
}

impl IntoOutcome for () {
    fn into_outcome(self) -> Result<(), BoxError> { Ok(()) }
}

impl<E: Into<BoxError>> IntoOutcome for Result<(), E> {
    fn into_outcome(self) -> Result<(), BoxError> { self.map_err(Into::into) }
}

// ── Next ─────────────────────────────────────────────────────────────────────

trait ErasedNext: Send + Sync + 'static {
    fn call(&self, err: Option<TrappedError>) -> BoxFuture;
}

struct FnNext<F>(F);

impl<F, Fut> ErasedNext for FnNext<F>
where
    F: Fn(Option<TrappedError>) -> Fut + Send + Sync + 'static,
    Fut: Future + Send + 'static,
    Fut::Output: IntoOutcome,
{
    fn call(&self, err: Option<TrappedError>) -> BoxFuture {
        let fut = (self.0)(err);
        Box::pin(async move { fut.await.into_outcome() })
    }
}

/// The rest of the pipeline, as seen from the isolation middleware.
///
/// Cheap to clone: every clone calls the same continuation.
///
/// ```rust
/// use cordon::Next;
///
/// let next = Next::new(|err| async move {
///     if let Some(err) = err {
///         eprintln!("pipeline failed: {err}");
///     }
/// });
/// ```
#[derive(Clone)]
pub struct Next {
    inner: Arc<dyn ErasedNext>,
}

impl Next {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Option<TrappedError>) -> Fut + Send + Sync + 'static,
        Fut: Future + Send + 'static,
        Fut::Output: IntoOutcome,
    {
        Self { inner: Arc::new(FnNext(f)) }
    }

    /// Invokes the continuation. `None` runs the pipeline; `Some` forwards a
    /// trapped error to it.
    pub fn call(&self, err: Option<TrappedError>) -> BoxFuture {
        self.inner.call(err)
    }
}

impl fmt::Debug for Next {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Next")
    }
}
