//! # cordon
//!
//! Per-request error isolation for hyper services.
//!
//! ## The contract
//!
//! A request handler can fail in places its caller never sees: a spawned
//! task returns `Err` after the handler already returned, a completion
//! callback panics, a timer fires into half-torn-down state. cordon gives
//! every request its own [`Context`] and routes all of those failures back
//! to it. The request still gets an error response from your pipeline, the
//! failure is reported once, and nothing leaks into other requests.
//!
//! What cordon does:
//!
//! - **Isolation**: one [`Context`] per request, bound to its [`Request`]
//!   and [`Response`] handles
//! - **Attribution**: work spawned through a bound handle reports its
//!   failures (errors and panics) to that context
//! - **Recovery**: a trapped error is logged, then forwarded down the
//!   pipeline through [`Next`] so a response can still be produced
//! - **Fatal policy**: after a trapped error the process terminates by
//!   default (`SIGTERM` to itself), so a supervisor can replace an instance
//!   whose state may be corrupt; [`Action::LogOnly`] opts out. The error
//!   response is only written if the host drains connections on `SIGTERM`
//!
//! What cordon leaves to others: the transport, routing, timeouts and
//! restarts.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use cordon::{IsolatedService, Reply, Request, Response, TrappedError, middleware};
//!
//! async fn stage(req: Request, res: Response, err: Option<TrappedError>) {
//!     if err.is_some() {
//!         // cordon answers 500 for us when we leave the response unfinished.
//!         return;
//!     }
//!     // Deferred work: its failure is still attributed to this request.
//!     req.spawn(async move {
//!         tokio::time::sleep(Duration::from_millis(5)).await;
//!         res.send(Reply::text("done")).map_err(|_| "already replied")
//!     });
//! }
//!
//! let service = IsolatedService::new(middleware::isolation(None), stage);
//! // hand `service` to a hyper connection builder
//! # drop(service);
//! ```

mod config;
mod context;
mod error;
mod handle;
mod listeners;
mod next;
mod policy;
mod request;
mod response;
mod service;
mod sink;

pub mod middleware;

pub use config::{Config, FATAL_ACTION_VAR};
pub use context::{Context, ContextId, Reporter, State};
pub use error::{BoxError, Error, TrappedError};
pub use handle::{Bindable, HandleId};
pub use listeners::{ListenerId, Listeners};
pub use next::{BoxFuture, IntoOutcome, Next};
pub use policy::{Action, FatalPolicy, SignalTerminator, Terminator};
pub use request::Request;
pub use response::{ContentType, Reply, ReplyBuilder, Response};
pub use service::{IsolatedService, Stage};
pub use sink::{ErrorSink, StderrSink, TracingSink};
