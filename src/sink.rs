//! Where trapped errors are reported.
//!
//! The middleware reports every trapped error to one [`ErrorSink`] before it
//! forwards the error down the pipeline. Any `Fn(&str)` is a sink, so an
//! existing logger plugs in with a closure.

use std::io::Write;

/// Receives one formatted message per trapped error.
pub trait ErrorSink: Send + Sync + 'static {
    fn error(&self, message: &str);
}

impl<F> ErrorSink for F
where
    F: Fn(&str) + Send + Sync + 'static,
{
    fn error(&self, message: &str) {
        self(message)
    }
}

/// Reports through `tracing` at `error` level. The default sink.
///
/// Silent when no subscriber is installed; use [`StderrSink`] there.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink;

impl ErrorSink for TracingSink {
    fn error(&self, message: &str) {
        tracing::error!(target: "cordon", "{message}");
    }
}

/// Writes straight to standard error, for processes without a `tracing`
/// subscriber.
#[derive(Clone, Copy, Debug, Default)]
pub struct StderrSink;

impl ErrorSink for StderrSink {
    fn error(&self, message: &str) {
        // Nothing sensible to do if stderr itself is gone.
        let _ = writeln!(std::io::stderr().lock(), "{message}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn closures_are_sinks() {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let copy = Arc::clone(&lines);
        let sink: Box<dyn ErrorSink> = Box::new(move |msg: &str| copy.lock().unwrap().push(msg.to_owned()));

        sink.error("first");
        sink.error("second");
        assert_eq!(*lines.lock().unwrap(), ["first", "second"]);
    }
}
