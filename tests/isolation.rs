//! Lifecycle tests for the isolation middleware.
//!
//! Every test swaps in a recording terminator, so nothing here ever signals
//! the test process.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use cordon::middleware::{self, Isolation};
use cordon::{
    Action, BoxError, Context, Error, ErrorSink, Next, Request, Response, State, Terminator,
    TrappedError,
};
use tokio::sync::Notify;

// ============================================================================
// Fixtures
// ============================================================================

#[derive(Debug, PartialEq, thiserror::Error)]
#[error("boom #{0}")]
struct Boom(u32);

/// What the forwarded error call observed about the context at that moment.
#[derive(Debug)]
struct Snapshot {
    state: State,
    error_listeners: usize,
    finish_listeners: usize,
    request_bound: bool,
}

#[derive(Default)]
struct Recorder {
    proceeded: Mutex<Vec<Option<TrappedError>>>,
    reported: Mutex<Vec<String>>,
    terminations: AtomicUsize,
    terminated: Notify,
    forwarded: Notify,
    ctx: OnceLock<Context>,
    at_forward: Mutex<Option<Snapshot>>,
}

impl Recorder {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn proceeded(&self) -> Vec<Option<TrappedError>> {
        self.proceeded.lock().unwrap().clone()
    }

    fn reported(&self) -> Vec<String> {
        self.reported.lock().unwrap().clone()
    }

    fn terminations(&self) -> usize {
        self.terminations.load(Ordering::SeqCst)
    }
}

struct RecordingSink(Arc<Recorder>);

impl ErrorSink for RecordingSink {
    fn error(&self, message: &str) {
        self.0.reported.lock().unwrap().push(message.to_owned());
    }
}

struct RecordingTerminator(Arc<Recorder>);

impl Terminator for RecordingTerminator {
    fn terminate(&self, _err: &TrappedError) -> Result<(), Error> {
        self.0.terminations.fetch_add(1, Ordering::SeqCst);
        self.0.terminated.notify_one();
        Ok(())
    }
}

fn isolation(recorder: &Arc<Recorder>) -> Isolation {
    Isolation::new()
        .with_sink(RecordingSink(Arc::clone(recorder)))
        .with_terminator(RecordingTerminator(Arc::clone(recorder)))
}

/// A continuation that runs `work` on the normal path and, on the error path,
/// records what it sees and leaves the response to the caller.
fn next_with<F, Fut>(recorder: &Arc<Recorder>, req: &Request, res: &Response, work: F) -> Next
where
    F: Fn(Request, Response) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<(), BoxError>> + Send + 'static,
{
    let recorder = Arc::clone(recorder);
    let req = req.clone();
    let res = res.clone();
    let work = Arc::new(work);
    Next::new(move |err: Option<TrappedError>| {
        recorder.proceeded.lock().unwrap().push(err.clone());
        let recorder = Arc::clone(&recorder);
        let req = req.clone();
        let res = res.clone();
        let work = Arc::clone(&work);
        async move {
            match err {
                None => work(req, res).await,
                Some(_) => {
                    let ctx = recorder.ctx.get().expect("context stashed");
                    *recorder.at_forward.lock().unwrap() = Some(Snapshot {
                        state: ctx.state(),
                        error_listeners: ctx.error_listener_count(),
                        finish_listeners: res.finish_listener_count(),
                        request_bound: req.context().is_some(),
                    });
                    recorder.forwarded.notify_one();
                    Ok(())
                }
            }
        }
    })
}

fn ok() -> Result<(), BoxError> {
    Ok(())
}

fn fail(err: impl Into<BoxError>) -> Result<(), BoxError> {
    Err(err.into())
}

async fn within<F: std::future::Future>(fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(2), fut).await.expect("timed out")
}

// ============================================================================
// Normal completion
// ============================================================================

#[tokio::test]
async fn completed_request_cleans_up_once_and_never_traps() {
    let recorder = Recorder::new();
    let req = Request::get("/ok");
    let res = Response::new();

    let finishes = Arc::new(AtomicUsize::new(0));
    {
        let finishes = Arc::clone(&finishes);
        res.on_finish(move |_| {
            finishes.fetch_add(1, Ordering::SeqCst);
        });
    }

    let next = next_with(&recorder, &req, &res, |_req, res| async move {
        res.finish();
        ok()
    });
    let ctx = isolation(&recorder).handle(&req, &res, next);

    // Both traps are live before the continuation has had a chance to run.
    assert_eq!(ctx.state(), State::Running);
    assert_eq!(ctx.error_listener_count(), 1);
    assert_eq!(res.finish_listener_count(), 2);
    assert_eq!(ctx.member_count(), 2);
    assert!(recorder.proceeded().is_empty());

    within(ctx.closed()).await;

    assert_eq!(recorder.proceeded().len(), 1);
    assert!(recorder.proceeded()[0].is_none());
    assert_eq!(finishes.load(Ordering::SeqCst), 1);
    assert!(ctx.is_exited());
    assert!(!ctx.exit());

    assert_eq!(ctx.error_listener_count(), 0);
    assert_eq!(res.finish_listener_count(), 1);
    assert_eq!(ctx.member_count(), 0);
    assert!(req.context().is_none());
    assert!(res.context().is_none());

    assert!(!ctx.report(TrappedError::failed("late")));
    assert!(recorder.reported().is_empty());
    assert_eq!(recorder.terminations(), 0);
}

#[tokio::test]
async fn an_abandoned_request_releases_its_response() {
    let recorder = Recorder::new();
    let req = Request::get("/");
    let (res, reply) = Response::channel();

    let next = Next::new(|_err: Option<TrappedError>| async {});
    let ctx = isolation(&recorder).handle(&req, &res, next);
    drop((req, res, ctx));

    // The reply sender goes away with the last handle.
    assert!(within(reply).await.is_err());
    assert!(recorder.proceeded().is_empty());
    assert_eq!(recorder.terminations(), 0);
}

// ============================================================================
// Trapped errors
// ============================================================================

#[tokio::test]
async fn deferred_error_is_trapped_forwarded_and_terminates_once() {
    let recorder = Recorder::new();
    let req = Request::get("/boom");
    let res = Response::new();

    let next = next_with(&recorder, &req, &res, |req, _res| async move {
        req.spawn(async {
            tokio::task::yield_now().await;
            Err::<(), _>(Boom(7))
        });
        ok()
    });
    let ctx = isolation(&recorder).handle(&req, &res, next);
    recorder.ctx.set(ctx.clone()).unwrap();

    within(recorder.terminated.notified()).await;

    let proceeded = recorder.proceeded();
    assert_eq!(proceeded.len(), 2);
    assert!(proceeded[0].is_none());
    let forwarded = proceeded[1].as_ref().unwrap();
    assert_eq!(forwarded.downcast_ref::<Boom>(), Some(&Boom(7)));

    let reported = recorder.reported();
    assert_eq!(reported.len(), 1);
    assert!(reported[0].contains("boom #7"), "{reported:?}");
    assert!(reported[0].starts_with(&ctx.id().to_string()));

    let seen = recorder.at_forward.lock().unwrap().take().unwrap();
    assert_eq!(seen.state, State::CleanedUp);
    assert_eq!(seen.error_listeners, 0);
    assert_eq!(seen.finish_listeners, 0);
    assert!(!seen.request_bound);

    assert_eq!(recorder.terminations(), 1);
}

#[tokio::test]
async fn completion_after_an_error_does_nothing() {
    let recorder = Recorder::new();
    let req = Request::get("/");
    let res = Response::new();

    let next = next_with(&recorder, &req, &res, |_req, _res| async { fail("failed") });
    let ctx = isolation(&recorder).handle(&req, &res, next);
    recorder.ctx.set(ctx.clone()).unwrap();
    within(recorder.terminated.notified()).await;

    assert!(res.finish());
    assert!(!ctx.report(TrappedError::failed("again")));
    tokio::task::yield_now().await;

    assert_eq!(ctx.state(), State::CleanedUp);
    assert_eq!(recorder.reported().len(), 1);
    assert_eq!(recorder.proceeded().len(), 2);
    assert_eq!(recorder.terminations(), 1);
}

#[tokio::test]
async fn an_error_after_completion_is_not_trapped() {
    let recorder = Recorder::new();
    let req = Request::get("/");
    let res = Response::new();

    let next = next_with(&recorder, &req, &res, |_req, res| async move {
        res.finish();
        fail("too late")
    });
    let ctx = isolation(&recorder).handle(&req, &res, next);
    within(ctx.closed()).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(recorder.proceeded().len(), 1);
    assert!(recorder.reported().is_empty());
    assert_eq!(recorder.terminations(), 0);
}

#[tokio::test]
async fn synchronous_panic_in_proceed_is_trapped() {
    let recorder = Recorder::new();
    let req = Request::get("/");
    let res = Response::new();

    let forwarded = Arc::new(Mutex::new(None));
    let next = {
        let forwarded = Arc::clone(&forwarded);
        Next::new(move |err: Option<TrappedError>| {
            if err.is_none() {
                panic!("handler exploded");
            }
            *forwarded.lock().unwrap() = err;
            async {}
        })
    };
    let ctx = isolation(&recorder).handle(&req, &res, next);
    within(recorder.terminated.notified()).await;

    let err = forwarded.lock().unwrap().take().unwrap();
    assert!(err.is_panic());
    assert_eq!(err.to_string(), "panicked: handler exploded");
    assert_eq!(ctx.state(), State::CleanedUp);
}

#[tokio::test]
async fn errors_reported_through_a_reporter_are_trapped() {
    let recorder = Recorder::new();
    let req = Request::get("/");
    let res = Response::new();

    let next = next_with(&recorder, &req, &res, |req, _res| async move {
        let reporter = req.reporter().expect("request is bound");
        std::thread::spawn(move || reporter.report(Boom(3)));
        ok()
    });
    let ctx = isolation(&recorder).handle(&req, &res, next);
    recorder.ctx.set(ctx.clone()).unwrap();
    within(recorder.terminated.notified()).await;

    let forwarded = recorder.proceeded()[1].clone().unwrap();
    assert_eq!(forwarded.downcast_ref::<Boom>(), Some(&Boom(3)));
}

// ============================================================================
// Fatal policy
// ============================================================================

#[tokio::test]
async fn log_only_policy_keeps_the_process() {
    let recorder = Recorder::new();
    let req = Request::get("/");
    let res = Response::new();

    let next = next_with(&recorder, &req, &res, |_req, _res| async { fail("failed") });
    let ctx = isolation(&recorder).with_policy(Action::LogOnly).handle(&req, &res, next);
    recorder.ctx.set(ctx.clone()).unwrap();

    within(recorder.forwarded.notified()).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(recorder.reported().len(), 1);
    assert_eq!(recorder.terminations(), 0);
}

#[tokio::test]
async fn policy_sees_the_trapped_error() {
    let recorder = Recorder::new();
    let req = Request::get("/");
    let res = Response::new();

    let decided = Arc::new(Mutex::new(Vec::new()));
    let policy = {
        let decided = Arc::clone(&decided);
        move |err: &TrappedError| {
            decided.lock().unwrap().push(err.to_string());
            Action::LogOnly
        }
    };

    let next = next_with(&recorder, &req, &res, |_req, _res| async { fail(Boom(1)) });
    let ctx = isolation(&recorder).with_policy(policy).handle(&req, &res, next);
    recorder.ctx.set(ctx.clone()).unwrap();
    within(recorder.forwarded.notified()).await;

    assert_eq!(*decided.lock().unwrap(), ["boom #1"]);
    assert_eq!(recorder.terminations(), 0);
}

// ============================================================================
// Independence and configuration
// ============================================================================

#[tokio::test]
async fn sequential_requests_get_independent_contexts() {
    let recorder = Recorder::new();
    let isolation = isolation(&recorder);

    let first_req = Request::get("/first");
    let first_res = Response::new();
    let next = next_with(&recorder, &first_req, &first_res, |_req, _res| async { fail(Boom(1)) });
    let first = isolation.handle(&first_req, &first_res, next);
    recorder.ctx.set(first.clone()).unwrap();
    within(recorder.terminated.notified()).await;

    let second_recorder = Recorder::new();
    let second_req = Request::get("/second");
    let second_res = Response::new();
    let next = next_with(&second_recorder, &second_req, &second_res, |_req, res| async move {
        res.finish();
        ok()
    });
    let second = isolation.handle(&second_req, &second_res, next);

    assert_ne!(first.id(), second.id());
    assert_eq!(first.state(), State::CleanedUp);
    assert_eq!(second.error_listener_count(), 1);
    assert_eq!(second_req.context().map(|c| c.id()), Some(second.id()));

    within(second.closed()).await;
    assert_eq!(second_recorder.proceeded().len(), 1);
    assert!(second_recorder.proceeded()[0].is_none());
    assert_eq!(recorder.terminations(), 1);
    assert_eq!(recorder.reported().len(), 1);
}

#[tokio::test]
async fn registration_accepts_an_optional_logger() {
    let recorder = Recorder::new();
    let sink: Arc<dyn ErrorSink> = Arc::new(RecordingSink(Arc::clone(&recorder)));
    let isolation = middleware::isolation(Some(sink))
        .with_policy(Action::LogOnly)
        .with_terminator(RecordingTerminator(Arc::clone(&recorder)));

    let req = Request::get("/");
    let res = Response::new();
    let next = next_with(&recorder, &req, &res, |_req, _res| async { fail("logged") });
    let ctx = isolation.handle(&req, &res, next);
    recorder.ctx.set(ctx.clone()).unwrap();
    within(recorder.forwarded.notified()).await;

    assert_eq!(recorder.reported().len(), 1);
    assert!(recorder.reported()[0].ends_with("trapped error: logged"));
}
