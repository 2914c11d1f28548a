use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use tether_types::{TaskError, TaskId};

/// Terminal outcome a worker delivers for a task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Handler payload, already serialized.
    Success(Vec<u8>),
    /// Failure to reconstruct on the waiter side.
    Failure(TaskError),
}

/// The rendezvous contract between the submitting side and the worker side.
///
/// The in-memory and distributed implementations are interchangeable from a
/// caller's observable semantics; they differ only in which clock enforces
/// the task deadline, and never by more than a sweep period.
#[async_trait]
pub trait TaskCoordinator: Send + Sync {
    /// Register a fresh `Pending` task and return its id.
    ///
    /// The task carries a deadline of `task_timeout` from creation; if no
    /// completion arrives by then it is forced to `Failed` with a timeout
    /// error, and no later completion may overwrite that.
    async fn create_task(&self, response_type: &str) -> Result<TaskId, TaskError>;

    /// Publish the terminal state for a task.
    ///
    /// Transitions are first-writer-wins: completions for an unknown or
    /// already-terminal task are discarded without error, so retry races on
    /// the worker side stay harmless.
    async fn complete_task(&self, task_id: &TaskId, outcome: TaskOutcome)
    -> Result<(), TaskError>;

    /// Block until the task reaches a terminal state, the deadline passes
    /// (`Timeout`), or `cancel` fires (`Cancelled`).
    ///
    /// Returns the payload on `Completed` and reconstructs the recorded
    /// error on `Failed`. An unknown task id fails with `NotFound`.
    /// Cancellation is advisory at the rendezvous: the worker keeps running
    /// and the abandoned record is reclaimed by expiration.
    async fn wait_for_completion(
        &self,
        task_id: &TaskId,
        cancel: CancellationToken,
    ) -> Result<Vec<u8>, TaskError>;

    /// Remove the task record. Idempotent and safe to call while a waiter
    /// is suspended.
    async fn cleanup_task(&self, task_id: &TaskId) -> Result<(), TaskError>;
}
