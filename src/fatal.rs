//! Fatal signals and the process-wide fault boundary.
//!
//! A [FatalSignal] is not a recoverable-error channel. Raising one is a
//! statement that this node's internal invariants may no longer hold
//! (security subsystem corruption, a broken write-once field, ...).
//! Connection-scoped failures use the ordinary error types instead and are
//! contained at the connection.

use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt::{self, Display, Formatter};

use tracing::error;

type Cause = Box<dyn StdError + Send + Sync>;

/// An unrecoverable node-local failure.
///
/// One error kind with a small set of named constructors instead of an
/// exception hierarchy. Intermediate layers may wrap a signal with
/// [FatalSignal::context] to attach information, but must never convert it
/// into a recoverable error; it has to reach a [FaultBoundary].
#[derive(Debug)]
pub struct FatalSignal {
    message: Option<String>,
    cause: Option<Cause>,
    retain_suppressed: bool,
    suppressed: Vec<Cause>,
    backtrace: Option<Backtrace>,
}

impl Default for FatalSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl FatalSignal {
    /// A signal with no context at all (suppression retained, backtrace
    /// captured).
    pub fn new() -> Self {
        Self {
            message: None,
            cause: None,
            retain_suppressed: true,
            suppressed: Vec::new(),
            backtrace: Some(Backtrace::force_capture()),
        }
    }

    /// Full-context constructor.
    ///
    /// `capture_backtrace: false` skips the stack snapshot, for raising on
    /// hot paths where capturing context is too expensive.
    /// `retain_suppressed: false` makes [FatalSignal::add_suppressed] drop
    /// secondary errors instead of accumulating them.
    pub fn full(
        message: impl Into<String>,
        cause: impl Into<Cause>,
        retain_suppressed: bool,
        capture_backtrace: bool,
    ) -> Self {
        Self {
            message: Some(message.into()),
            cause: Some(cause.into()),
            retain_suppressed,
            suppressed: Vec::new(),
            backtrace: capture_backtrace.then(Backtrace::force_capture),
        }
    }

    /// Message and cause, with default capture behavior (suppressed errors
    /// retained, backtrace captured).
    pub fn with_cause(message: impl Into<String>, cause: impl Into<Cause>) -> Self {
        Self::full(message, cause, true, true)
    }

    /// Message only.
    pub fn msg(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::new()
        }
    }

    /// Cause only.
    pub fn from_cause(cause: impl Into<Cause>) -> Self {
        Self {
            cause: Some(cause.into()),
            ..Self::new()
        }
    }

    /// Wrap this signal in a new one carrying `message`, keeping the
    /// original reachable through [std::error::Error::source].
    pub fn context(self, message: impl Into<String>) -> Self {
        Self::with_cause(message, Box::new(self) as Cause)
    }

    /// Record a secondary error that surfaced while handling this signal.
    /// Dropped when suppression retention is disabled.
    pub fn add_suppressed(&mut self, error: impl Into<Cause>) {
        if self.retain_suppressed {
            self.suppressed.push(error.into());
        }
    }

    // === Getters ===

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn cause(&self) -> Option<&(dyn StdError + Send + Sync)> {
        self.cause.as_deref()
    }

    pub fn suppressed(&self) -> &[Cause] {
        &self.suppressed
    }

    pub fn backtrace(&self) -> Option<&Backtrace> {
        self.backtrace.as_ref()
    }
}

impl Display for FatalSignal {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match (&self.message, &self.cause) {
            (Some(message), Some(cause)) => write!(f, "fatal: {message}: {cause}"),
            (Some(message), None) => write!(f, "fatal: {message}"),
            (None, Some(cause)) => write!(f, "fatal: {cause}"),
            (None, None) => write!(f, "fatal signal"),
        }
    }
}

impl StdError for FatalSignal {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn StdError + 'static))
    }
}

/// The process-level collaborator that observes raised fatal signals and
/// decides node shutdown or alerting. The substrate's contract is only
/// "propagate, never swallow": every signal raised inside a worker or
/// channel handler ends up in exactly one `on_fatal` call.
pub trait FaultBoundary: Send + Sync {
    fn on_fatal(&self, signal: FatalSignal);
}

/// Last-resort boundary that logs the signal loudly. Used as the default
/// pool boundary so a misconfigured process still cannot lose a signal
/// silently.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogFaultBoundary;

impl FaultBoundary for LogFaultBoundary {
    fn on_fatal(&self, signal: FatalSignal) {
        error!(%signal, backtrace = ?signal.backtrace(), "Fatal signal reached the fault boundary");
    }
}

/// Forwards signals over a channel to a supervisor thread, which observes
/// them unmodified (message and cause preserved).
#[derive(Debug, Clone)]
pub struct FaultSink {
    sender: flume::Sender<FatalSignal>,
}

impl FaultSink {
    pub fn new() -> (Self, flume::Receiver<FatalSignal>) {
        let (sender, receiver) = flume::unbounded();

        (Self { sender }, receiver)
    }
}

impl FaultBoundary for FaultSink {
    fn on_fatal(&self, signal: FatalSignal) {
        if let Err(dropped) = self.sender.send(signal) {
            // The supervisor went away. Still never swallow.
            error!(signal = %dropped.0, "Fault sink disconnected, logging fatal signal instead");
        }
    }
}
