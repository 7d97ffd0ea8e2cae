//! Installing the middleware in front of a hyper pipeline.
//!
//! [`IsolatedService`] is a hyper [`Service`]: hand it to any hyper
//! connection builder and every request runs through [`Isolation`] before it
//! reaches your [`Stage`].
//!
//! ```text
//! hyper ─► IsolatedService::call
//!            │ collect body → Request
//!            │ Response::channel()
//!            │ Isolation::handle(req, res, next = stage)
//!            ▼
//!          reply ◄── res.send(reply) from the stage (or its spawned work)
//!            └─ every handle dropped, no reply → 500
//! ```
//!
//! The stage is called with `None` on the normal path and with `Some(err)`
//! after a trapped error. If it leaves the response unfinished on the error
//! call, the service answers `500 Internal Server Error` for it.
//!
//! Once the stage and all the work it spawned have ended, nothing is left
//! that could reply: the response handles are dropped with the context and
//! the service answers `500` as well. A request whose work is still running
//! but never replies stays open; timeouts belong to the server or a layer in
//! front of this one.

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use http::StatusCode;
use http_body_util::{BodyExt, Full};
use hyper::body::Body;
use hyper::service::Service;
use tracing::{debug, warn};

use crate::error::{BoxError, Error, TrappedError};
use crate::middleware::Isolation;
use crate::next::{BoxFuture, IntoOutcome, Next};
use crate::request::Request;
use crate::response::{Reply, Response};

// ── Stage ────────────────────────────────────────────────────────────────────

#[doc(hidden)]
pub trait ErasedStage: Send + Sync + 'static {
    fn call(&self, req: Request, res: Response, err: Option<TrappedError>) -> BoxFuture;
}

#[doc(hidden)]
pub type BoxedStage = Arc<dyn ErasedStage>;

/// The part of the pipeline that runs behind the middleware.
///
/// You never implement this yourself. It is satisfied by any function or
/// closure shaped like:
///
/// ```text
/// async fn stage(req: Request, res: Response, err: Option<TrappedError>) -> () | Result<(), E>
/// ```
///
/// The trait is sealed so the blanket impl stays the only one.
pub trait Stage: private::Sealed + Send + Sync + 'static {
    #[doc(hidden)]
    fn into_boxed_stage(self) -> BoxedStage;
}

mod private {
    pub trait Sealed {}
}

impl<F, Fut> private::Sealed for F
where
    F: Fn(Request, Response, Option<TrappedError>) -> Fut + Send + Sync + 'static,
    Fut: Future + Send + 'static,
    Fut::Output: IntoOutcome,
{
}

impl<F, Fut> Stage for F
where
    F: Fn(Request, Response, Option<TrappedError>) -> Fut + Send + Sync + 'static,
    Fut: Future + Send + 'static,
    Fut::Output: IntoOutcome,
{
    fn into_boxed_stage(self) -> BoxedStage {
        Arc::new(FnStage(self))
    }
}

struct FnStage<F>(F);

impl<F, Fut> ErasedStage for FnStage<F>
where
    F: Fn(Request, Response, Option<TrappedError>) -> Fut + Send + Sync + 'static,
    Fut: Future + Send + 'static,
    Fut::Output: IntoOutcome,
{
    fn call(&self, req: Request, res: Response, err: Option<TrappedError>) -> BoxFuture {
        let fut = (self.0)(req, res, err);
        Box::pin(async move { fut.await.into_outcome() })
    }
}

// ── IsolatedService ──────────────────────────────────────────────────────────

/// A hyper service running every request through [`Isolation`].
#[derive(Clone)]
pub struct IsolatedService {
    isolation: Isolation,
    stage: BoxedStage,
}

impl IsolatedService {
    pub fn new(isolation: Isolation, stage: impl Stage) -> Self {
        Self { isolation, stage: stage.into_boxed_stage() }
    }

    /// Drives one request through the pipeline and waits for its reply.
    pub async fn dispatch<B>(&self, req: http::Request<B>) -> http::Response<Full<Bytes>>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<BoxError>,
    {
        let (parts, body) = req.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                let err = Error::Body(e.into());
                warn!(method = %parts.method, path = %parts.uri.path(), "{err}");
                return Reply::status(StatusCode::BAD_REQUEST).into_http();
            }
        };

        let request = Request::from_parts(parts, body);
        let (response, reply) = Response::channel();
        let next = self.next(&request, &response);

        let ctx = self.isolation.handle(&request, &response, next);
        debug!(context = %ctx.id(), method = %request.method(), path = %request.path(), "request isolated");
        drop((request, response, ctx));

        match reply.await {
            Ok(reply) => reply.into_http(),
            Err(_) => {
                warn!("pipeline dropped the response without replying");
                Reply::status(StatusCode::INTERNAL_SERVER_ERROR).into_http()
            }
        }
    }

    /// `proceed` for one request: the stage, plus the fallback `500` when the
    /// stage leaves a failed request unanswered.
    fn next(&self, request: &Request, response: &Response) -> Next {
        let stage = Arc::clone(&self.stage);
        let request = request.clone();
        let response = response.clone();
        Next::new(move |err: Option<TrappedError>| {
            let stage = Arc::clone(&stage);
            let req = request.clone();
            let res = response.clone();
            async move {
                let failed = err.is_some();
                let outcome = stage.call(req, res.clone(), err).await;
                if failed && !res.is_finished() {
                    let _ = res.send(Reply::status(StatusCode::INTERNAL_SERVER_ERROR));
                }
                outcome
            }
        })
    }
}

impl<B> Service<http::Request<B>> for IsolatedService
where
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<BoxError>,
{
    type Response = http::Response<Full<Bytes>>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn call(&self, req: http::Request<B>) -> Self::Future {
        let service = self.clone();
        Box::pin(async move { Ok(service.dispatch(req).await) })
    }
}
