//! What happens to the process after a trapped error.
//!
//! A trapped error means something inside the request failed outside its
//! normal error path: a handler panicked, a detached task failed halfway.
//! Shared state may be inconsistent, so the default [`Action`] is
//! [`Action::TerminateProcess`]: the failing request still gets its error
//! response, then the process sends itself `SIGTERM` and relies on its
//! supervisor (systemd, Kubernetes, a process manager) to start a fresh one.
//!
//! The signal goes out once the error response has been handed to the
//! transport, not once it has been written. The failing request only gets
//! its response if the host shuts down gracefully on `SIGTERM`, draining
//! in-flight connections before it exits (the bundled demo does). A host
//! that keeps the default `SIGTERM` disposition dies before hyper flushes
//! anything; such hosts should use [`Action::LogOnly`] or their own
//! [`Terminator`].
//!
//! ```text
//! trapped error ─► FatalPolicy::decide(&err) ─┬─ LogOnly          → keep serving
//!                                             └─ TerminateProcess → Terminator::terminate
//! ```
//!
//! Both halves are injectable: a [`FatalPolicy`] picks the action per error,
//! a [`Terminator`] carries it out. Tests swap in a recording terminator so
//! nothing ever signals the test process.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::warn;

use crate::error::{Error, TrappedError};

/// The action taken once a trapped error has been forwarded downstream.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Action {
    /// Report the error and keep the process running.
    LogOnly,
    /// Report the error, then ask the process to terminate (default).
    #[default]
    TerminateProcess,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LogOnly          => "log-only",
            Self::TerminateProcess => "terminate",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parses `terminate` or `log-only` (case-insensitive, `_` accepted for `-`).
impl FromStr for Action {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "terminate" | "terminate-process" => Ok(Self::TerminateProcess),
            "log-only" | "log"                => Ok(Self::LogOnly),
            _                                 => Err(()),
        }
    }
}

// ── FatalPolicy ──────────────────────────────────────────────────────────────

/// Decides the [`Action`] for a trapped error.
///
/// Implemented for every `Fn(&TrappedError) -> Action`, and for [`Action`]
/// itself (a fixed decision).
pub trait FatalPolicy: Send + Sync + 'static {
    fn decide(&self, err: &TrappedError) -> Action;
}

impl FatalPolicy for Action {
    fn decide(&self, _err: &TrappedError) -> Action {
        *self
    }
}

impl<F> FatalPolicy for F
where
    F: Fn(&TrappedError) -> Action + Send + Sync + 'static,
{
    fn decide(&self, err: &TrappedError) -> Action {
        self(err)
    }
}

// ── Terminator ───────────────────────────────────────────────────────────────

/// Carries out [`Action::TerminateProcess`].
pub trait Terminator: Send + Sync + 'static {
    fn terminate(&self, err: &TrappedError) -> Result<(), Error>;
}

/// Sends `SIGTERM` to the current process, at most once per process.
///
/// Pair it with a graceful `SIGTERM` shutdown in the host, or responses
/// still in flight are lost with the process.
///
/// On non-Unix targets there is no signal to send; the process exits with
/// status 1 instead.
#[derive(Clone, Copy, Debug, Default)]
pub struct SignalTerminator;

static TERMINATION_SENT: AtomicBool = AtomicBool::new(false);

impl Terminator for SignalTerminator {
    fn terminate(&self, err: &TrappedError) -> Result<(), Error> {
        if TERMINATION_SENT.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        warn!(error = %err, "terminating process after trapped error");
        send_sigterm()
    }
}

#[cfg(unix)]
fn send_sigterm() -> Result<(), Error> {
    // SAFETY: getpid has no preconditions; kill with our own pid and a valid
    // signal number only queues the signal.
    let rc = unsafe { libc::kill(libc::getpid(), libc::SIGTERM) };
    if rc == 0 {
        Ok(())
    } else {
        Err(Error::Io(std::io::Error::last_os_error()))
    }
}

#[cfg(not(unix))]
fn send_sigterm() -> Result<(), Error> {
    std::process::exit(1)
}
