//! Outbound response handle and the [`Reply`] it carries.
//!
//! A [`Response`] is the pipeline's side of the exchange: it has a
//! "finished" event, fired exactly once, and optionally a one-shot channel
//! back to the transport. The [`Reply`] is the value that travels down that
//! channel: status, headers and body.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use http::StatusCode;
use http_body_util::Full;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::context::{self, Context, Reporter};
use crate::error::BoxError;
use crate::handle::{Bindable, Binding, HandleId};
use crate::listeners::{ListenerId, Listeners};

// ── Response ─────────────────────────────────────────────────────────────────

/// The outbound side of one request.
///
/// Cloning is cheap; all clones share the finished event and the reply
/// channel.
#[derive(Clone, Debug)]
pub struct Response {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    id: HandleId,
    finished: AtomicBool,
    on_finish: Listeners<()>,
    reply: Mutex<Option<oneshot::Sender<Reply>>>,
    binding: Binding,
}

impl Response {
    /// A response with no transport behind it. `send` only fires the
    /// finished event.
    pub fn new() -> Self {
        Self::with_sender(None)
    }

    /// A response wired to a transport: the reply passed to
    /// [`send`](Response::send) arrives on the returned receiver.
    pub fn channel() -> (Self, oneshot::Receiver<Reply>) {
        let (tx, rx) = oneshot::channel();
        (Self::with_sender(Some(tx)), rx)
    }

    fn with_sender(sender: Option<oneshot::Sender<Reply>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: HandleId::next(),
                finished: AtomicBool::new(false),
                on_finish: Listeners::new(),
                reply: Mutex::new(sender),
                binding: Binding::default(),
            }),
        }
    }

    pub fn id(&self) -> HandleId {
        self.inner.id
    }

    /// Hands `reply` to the transport and finishes the response.
    ///
    /// A response can be sent once; later attempts get their reply back.
    pub fn send(&self, reply: Reply) -> Result<(), Reply> {
        if !self.claim() {
            return Err(reply);
        }
        let sender = self.inner.reply.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(tx) = sender {
            // Err means the transport hung up.
            let _ = tx.send(reply);
        }
        self.inner.on_finish.emit(&());
        Ok(())
    }

    /// Fires the finished event. Only the first call does anything.
    pub fn finish(&self) -> bool {
        if !self.claim() {
            return false;
        }
        self.inner.on_finish.emit(&());
        true
    }

    /// Marks the response finished. Exactly one caller ever gets `true`.
    fn claim(&self) -> bool {
        !self.inner.finished.swap(true, Ordering::AcqRel)
    }

    pub fn is_finished(&self) -> bool {
        self.inner.finished.load(Ordering::Acquire)
    }

    /// Attaches a listener to the finished event.
    pub fn on_finish(&self, handler: impl Fn(&()) + Send + Sync + 'static) -> ListenerId {
        self.inner.on_finish.on(handler)
    }

    /// Detaches a finished listener. Returns `false` if it was not attached.
    pub fn remove_finish_listener(&self, id: ListenerId) -> bool {
        self.inner.on_finish.remove(id)
    }

    pub fn finish_listener_count(&self) -> usize {
        self.inner.on_finish.len()
    }

    /// The context this response is bound to, if any.
    pub fn context(&self) -> Option<Context> {
        self.inner.binding.get()
    }

    pub fn reporter(&self) -> Option<Reporter> {
        self.context().map(|ctx| ctx.reporter())
    }

    /// Spawns work on behalf of this response (deferred writes, streaming).
    ///
    /// Attribution follows the same rules as
    /// [`Request::spawn`](crate::Request::spawn).
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

impl Default for Response {
    fn default() -> Self { Self::new() }
}

impl Bindable for Response {
    fn handle_id(&self) -> HandleId {
        self.inner.id
    }

    fn binding(&self) -> &Binding {
        &self.inner.binding
    }
}

// ── ContentType ──────────────────────────────────────────────────────────────

/// Common content-type values for use with [`ReplyBuilder::bytes`].
#[derive(Clone, Copy, Debug)]
pub enum ContentType {
    Html,         // text/html; charset=utf-8
    Json,         // application/json
    OctetStream,  // application/octet-stream
    Text,         // text/plain; charset=utf-8
}

impl ContentType {
    fn as_str(self) -> &'static str {
        match self {
            Self::Html        => "text/html; charset=utf-8",
            Self::Json        => "application/json",
            Self::OctetStream => "application/octet-stream",
            Self::Text        => "text/plain; charset=utf-8",
        }
    }
}

// ── Reply ────────────────────────────────────────────────────────────────────

/// What the transport writes back to the client.
///
/// ```rust
/// use cordon::Reply;
/// use http::StatusCode;
///
/// Reply::json(br#"{"id":1}"#.to_vec());
/// Reply::text("hello");
/// Reply::status(StatusCode::NO_CONTENT);
///
/// Reply::builder()
///     .status(StatusCode::CREATED)
///     .header("location", "/users/42")
///     .json(br#"{"id":42}"#.to_vec());
/// ```
#[derive(Clone, Debug)]
pub struct Reply {
    status: StatusCode,
    headers: Vec<(String, String)>,
    body: Bytes,
}

impl Reply {
    /// `200 OK`, `application/json`.
    pub fn json(body: impl Into<Bytes>) -> Self {
        Self::builder().json(body)
    }

    /// `200 OK`, `text/plain; charset=utf-8`.
    pub fn text(body: impl Into<String>) -> Self {
        Self::builder().text(body)
    }

    /// A reply with no body.
    pub fn status(status: StatusCode) -> Self {
        Self::builder().status(status).no_body()
    }

    pub fn builder() -> ReplyBuilder {
        ReplyBuilder { headers: Vec::new(), status: StatusCode::OK }
    }

    pub fn status_code(&self) -> StatusCode { self.status }
    pub fn headers(&self) -> &[(String, String)] { &self.headers }
    pub fn body(&self) -> &Bytes { &self.body }

    /// Converts into the hyper response type.
    ///
    /// A header that is not valid HTTP turns the whole reply into a bare
    /// `500`.
    pub fn into_http(self) -> http::Response<Full<Bytes>> {
        let mut builder = http::Response::builder().status(self.status);
        for (name, value) in &self.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder.body(Full::new(self.body)).unwrap_or_else(|e| {
            tracing::error!("invalid reply: {e}");
            let mut fallback = http::Response::new(Full::new(Bytes::new()));
            *fallback.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            fallback
        })
    }
}

/// Fluent builder for [`Reply`]. Defaults to `200 OK`; finished by a typed
/// body method.
#[derive(Debug)]
pub struct ReplyBuilder {
    headers: Vec<(String, String)>,
    status: StatusCode,
}

impl ReplyBuilder {
    pub fn status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_owned(), value.to_owned()));
        self
    }

    pub fn json(self, body: impl Into<Bytes>) -> Reply {
        self.bytes(ContentType::Json, body)
    }

    pub fn text(self, body: impl Into<String>) -> Reply {
        let body: String = body.into();
        self.bytes(ContentType::Text, body)
    }

    pub fn bytes(self, content_type: ContentType, body: impl Into<Bytes>) -> Reply {
        let mut headers = vec![("content-type".to_owned(), content_type.as_str().to_owned())];
        headers.extend(self.headers);
        Reply { status: self.status, headers, body: body.into() }
    }

    pub fn no_body(self) -> Reply {
        Reply { status: self.status, headers: self.headers, body: Bytes::new() }
    }
}
