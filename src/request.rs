//! Inbound request handle.

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, Method, Uri};
use tokio::task::JoinHandle;

use crate::context::{self, Context, Reporter};
use crate::error::BoxError;
use crate::handle::{Bindable, Binding, HandleId};

/// An inbound request, as seen by the pipeline.
///
/// Cloning is cheap and every clone is the same handle: binding one clone to
/// a context binds them all.
#[derive(Clone, Debug)]
pub struct Request {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    id: HandleId,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
    binding: Binding,
}

impl Request {
    pub fn new(method: Method, uri: Uri, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: HandleId::next(),
                method,
                uri,
                headers,
                body,
                binding: Binding::default(),
            }),
        }
    }

    /// A bodiless `GET` for `uri`. Falls back to `/` if `uri` does not parse.
    pub fn get(uri: &str) -> Self {
        let uri = uri.parse().unwrap_or_else(|_| Uri::from_static("/"));
        Self::new(Method::GET, uri, HeaderMap::new(), Bytes::new())
    }

    pub(crate) fn from_parts(parts: http::request::Parts, body: Bytes) -> Self {
        Self::new(parts.method, parts.uri, parts.headers, body)
    }

    pub fn method(&self) -> &Method { &self.inner.method }
    pub fn uri(&self) -> &Uri { &self.inner.uri }
    pub fn path(&self) -> &str { self.inner.uri.path() }
    pub fn headers(&self) -> &HeaderMap { &self.inner.headers }
    pub fn body(&self) -> &Bytes { &self.inner.body }

    /// Header lookup. Names are case-insensitive; non-UTF-8 values are skipped.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.inner.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn id(&self) -> HandleId {
        self.inner.id
    }

    /// The context this request is bound to, if any.
    pub fn context(&self) -> Option<Context> {
        self.inner.binding.get()
    }

    /// A reporter for the bound context, if any.
    pub fn reporter(&self) -> Option<Reporter> {
        self.context().map(|ctx| ctx.reporter())
    }

    /// Spawns work on behalf of this request.
    ///
    /// While the request is bound, a failure is attributed to its context
    /// and reaches the context's error trap. Once unbound, the work runs
    /// detached and a failure is only logged.
    pub fn spawn<F, T, E>(&self, fut: F) -> JoinHandle<Option<T>>
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Into<BoxError>,
    {
        match self.context() {
            Some(ctx) => ctx.spawn(fut),
            None => context::spawn_detached(fut),
        }
    }
}

impl Bindable for Request {
    fn handle_id(&self) -> HandleId {
        self.inner.id
    }

    fn binding(&self) -> &Binding {
        &self.inner.binding
    }
}
