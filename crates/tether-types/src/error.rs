use std::fmt;

use serde::{Deserialize, Serialize};

/// Canonical category for a task failure.
///
/// This is a closed set: every failure that crosses the coordinator or the
/// bridge is folded into one of these kinds. It is used for policy decisions
/// (what the waiter raises, what the bridge retries) and for observability
/// dimensions in logs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// The waiter's deadline elapsed before a terminal transition.
    ///
    /// Raised on the waiter side only; the worker never emits it.
    Timeout,
    /// The waiter's cancel signal fired.
    ///
    /// This represents a control-flow decision, not necessarily a fault.
    /// The task record is left for the sweeper.
    Cancelled,
    /// The handler exhausted its retry budget.
    ///
    /// Delivered through the completion envelope and re-raised by the waiter.
    HandlerFailed,
    /// Encoding or decoding of a payload, record, or envelope failed.
    SerializationFailed,
    /// The coordinator's store or channel facility failed after bounded
    /// internal retries.
    CoordinatorInternal,
    /// Caller bug caught by validation at an API boundary.
    InvalidArgument,
    /// The waiter asked about a task id the coordinator does not know.
    NotFound,
}

/// Structured failure carried in completion envelopes and raised to waiters.
///
/// Replaces raw string errors with a stable shape that is easy to:
/// - classify (`kind`) against the closed set above,
/// - render (`message`) for user-facing summaries,
/// - enrich (`origin`) with an opaque remote frame for triage.
///
/// The original remote call stack is never re-executed on the waiter side;
/// it travels only as the `origin` string.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    /// Coarse failure category used by policy and observability.
    pub kind: ErrorKind,
    /// Human-readable summary safe to display in normal logs.
    pub message: String,
    /// Optional opaque origin frame from the failing side.
    ///
    /// Prefer concise, actionable context. Omit when no extra detail exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

impl TaskError {
    /// Creates a [`TaskError`] with required fields only.
    ///
    /// Use [`Self::with_origin`] to attach the optional origin frame.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            origin: None,
        }
    }

    /// Adds or replaces the optional origin frame.
    ///
    /// If called multiple times, the last value wins.
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// Validation failure naming the offending field or argument.
    pub fn invalid_argument(field: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, field)
    }

    /// Waiter-side deadline failure.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    /// Waiter-side cancellation.
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    /// Unknown task id.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    /// Codec failure on either side.
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::SerializationFailed, message)
    }

    /// Store or channel failure that survived bounded internal retries.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CoordinatorInternal, message)
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)?;
        if let Some(ref origin) = self.origin {
            write!(f, " ({})", origin)?;
        }
        Ok(())
    }
}

impl std::error::Error for TaskError {}
