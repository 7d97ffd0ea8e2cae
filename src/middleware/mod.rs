//! Middleware layer.
//!
//! Middleware sits in front of the request pipeline and is the right place
//! for cross-cutting concerns. cordon ships one: [`Isolation`], which runs
//! each request inside its own [`Context`](crate::Context) so that failures,
//! including ones raised long after the handler returned, are trapped,
//! reported and turned back into a pipeline error instead of escaping.
//!
//! Install it first, so everything after it is covered:
//!
//! ```rust,no_run
//! use cordon::middleware;
//!
//! let isolation = middleware::isolation(None);
//! ```

mod isolation;

use std::sync::Arc;

pub use isolation::Isolation;

use crate::sink::ErrorSink;

/// Builds the isolation middleware with the process configuration.
///
/// `logger` receives one message per trapped error; `None` reports through
/// `tracing`. The fatal action comes from `CORDON_FATAL_ACTION` and falls back
/// to terminating the process when the variable is unset or invalid.
///
/// `tracing` output goes nowhere until a subscriber is installed. A process
/// without one should pass [`StderrSink`](crate::StderrSink) so trapped
/// errors still reach standard error:
///
/// ```rust,no_run
/// use std::sync::Arc;
///
/// use cordon::{ErrorSink, StderrSink, middleware};
///
/// let sink: Arc<dyn ErrorSink> = Arc::new(StderrSink);
/// let isolation = middleware::isolation(Some(sink));
/// # drop(isolation);
/// ```
pub fn isolation(logger: Option<Arc<dyn ErrorSink>>) -> Isolation {
    let config = crate::Config::from_env().unwrap_or_else(|e| {
        tracing::warn!("{e}; using the default configuration");
        crate::Config::default()
    });
    Isolation::from_config(&config).with_logger(logger)
}
