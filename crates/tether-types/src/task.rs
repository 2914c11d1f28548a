use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TaskError;

/// Opaque rendezvous key for a single response-bearing submission.
///
/// A fresh id is a random 128-bit value rendered as 32 lowercase hex
/// characters. Unique within the coordinator's namespace for the task's
/// entire retention window.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Generate a fresh random task id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Wrap an existing id string (for example one carried in a job
    /// invocation blob). The value is treated as opaque.
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of a task.
///
/// Transitions are monotonic: `Pending -> Completed` or `Pending -> Failed`.
/// No reverse transition and no `Completed <-> Failed` transition is ever
/// observable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    /// Terminal.
    Completed,
    /// Terminal.
    Failed,
}

impl TaskStatus {
    /// Whether the task has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Completed => write!(f, "Completed"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// The cross-process rendezvous unit.
///
/// Exactly one of `result` / `error` is populated in any terminal state.
/// This struct is also the envelope's wire shape: the distributed
/// coordinator stores it as keyed JSON and publishes the terminal form on
/// the completion channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: TaskId,
    /// Stable identifier of the expected payload type, persisted so that
    /// producer and consumer can be different binaries of the same release.
    pub response_type: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub status: TaskStatus,
    /// Opaque serialized payload iff `status == Completed`. An empty
    /// payload is carried as `Some(vec![])`, distinct from absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Vec<u8>>,
    /// Recorded failure iff `status == Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
}

impl TaskRecord {
    /// Fresh `Pending` record for a newly created task.
    pub fn pending(task_id: TaskId, response_type: impl Into<String>) -> Self {
        Self {
            task_id,
            response_type: response_type.into(),
            created_at: Utc::now(),
            completed_at: None,
            status: TaskStatus::Pending,
            result: None,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Compare-and-set `Pending -> Completed`.
    ///
    /// Returns `false` (and leaves the record untouched) when the record is
    /// already terminal, so racing completions collapse to the first one.
    pub fn complete(&mut self, payload: Vec<u8>, at: DateTime<Utc>) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = TaskStatus::Completed;
        self.completed_at = Some(at);
        self.result = Some(payload);
        self.error = None;
        true
    }

    /// Compare-and-set `Pending -> Failed`.
    ///
    /// Same first-writer-wins contract as [`Self::complete`].
    pub fn fail(&mut self, error: TaskError, at: DateTime<Utc>) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = TaskStatus::Failed;
        self.completed_at = Some(at);
        self.result = None;
        self.error = Some(error);
        true
    }
}
