//! Error types.
//!
//! Two families live here and they never mix:
//!
//! - [`Error`] is what cordon's own fallible operations return: binding a
//!   listener, delivering a termination signal, reading configuration.
//! - [`TrappedError`] is what a context's error trap receives. It is never
//!   returned from the middleware; it travels to the pipeline through the
//!   `proceed` continuation instead.

use std::any::Any;
use std::sync::Arc;

use thiserror::Error;

/// A boxed, thread-safe error. The currency of downstream stages.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Infrastructure failures surfaced by cordon itself.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum Error {
    /// An OS-level operation failed (socket bind, signal delivery).
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// A configuration value could not be parsed.
    #[error("invalid value `{value}` for {key}")]
    Config {
        /// The configuration key that was read.
        key: &'static str,
        /// The rejected raw value.
        value: String,
    },

    /// The inbound request body could not be collected.
    #[error("body: {0}")]
    Body(BoxError),
}

/// An error captured by a context's error trap.
///
/// Clones share the same underlying allocation, so the trap, the error sink
/// and the forwarded `proceed` call all observe the exact same error object.
#[derive(Clone, Debug, Error)]
pub enum TrappedError {
    /// Work running inside the context returned an error.
    #[error("{0}")]
    Failed(Arc<dyn std::error::Error + Send + Sync + 'static>),

    /// Work running inside the context panicked.
    #[error("panicked: {0}")]
    Panicked(Arc<str>),
}

impl TrappedError {
    pub fn failed(err: impl Into<BoxError>) -> Self {
        Self::Failed(Arc::from(err.into()))
    }

    /// Builds a [`TrappedError::Panicked`] from a `catch_unwind` payload.
    pub(crate) fn panicked(payload: Box<dyn Any + Send>) -> Self {
        Self::Panicked(Arc::from(panic_message(payload.as_ref())))
    }

    /// Returns the original error if it is of type `E`.
    pub fn downcast_ref<E: std::error::Error + 'static>(&self) -> Option<&E> {
        match self {
            Self::Failed(err) => err.downcast_ref::<E>(),
            Self::Panicked(_) => None,
        }
    }

    pub fn is_panic(&self) -> bool {
        matches!(self, Self::Panicked(_))
    }

    /// `true` when both values carry the very same error allocation.
    pub fn same_as(&self, other: &TrappedError) -> bool {
        match (self, other) {
            (Self::Failed(a), Self::Failed(b)) => {
                std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
            }
            (Self::Panicked(a), Self::Panicked(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Extracts a readable message from a panic payload.
///
/// `panic!("literal")` yields `&'static str`, `panic!("{x}")` yields `String`;
/// anything else (`std::panic::panic_any`) is reported as `"unknown panic"`.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        (*msg).to_owned()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_owned()
    }
}
