use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use tether_types::{TaskError, TaskId};

/// How the worker hands the request to the user's handler registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvocationKind {
    /// Route to the single handler registered for the request type.
    Request,
    /// Fan out to every handler registered for the notification type.
    Notification,
}

impl Default for InvocationKind {
    fn default() -> Self {
        Self::Request
    }
}

/// The argument blob a job engine ships to a worker.
///
/// Everything the bridge needs rides in here: what to show in dashboards
/// (`display_name`), how the dispatcher finds the handler (`descriptor`),
/// the serialized request itself, the optional rendezvous key, and the
/// retry budget. Serde round-trips losslessly so any engine that can carry
/// bytes can carry an invocation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeInvocation {
    pub display_name: String,
    /// Stable identifier of the request type, used by the dispatcher to
    /// select handlers.
    pub descriptor: String,
    /// Serialized request body (JSON).
    pub body: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    /// Additional handler attempts after the first failure.
    pub retry_budget: u32,
    #[serde(default)]
    pub kind: InvocationKind,
}

impl BridgeInvocation {
    /// Pre-flight validation shared by the facade and the bridge.
    ///
    /// A body that serializes to JSON `null` counts as a missing request.
    /// Notifications have no rendezvous, so a task id on one is a caller
    /// bug.
    pub fn validate(&self) -> Result<(), TaskError> {
        if self.display_name.trim().is_empty() {
            return Err(TaskError::invalid_argument("display_name"));
        }
        if self.descriptor.is_empty() {
            return Err(TaskError::invalid_argument("descriptor"));
        }
        if self.body.is_empty() || self.body == b"null" {
            return Err(TaskError::invalid_argument("request"));
        }
        match (&self.task_id, self.kind) {
            (Some(task_id), _) if task_id.is_empty() => {
                Err(TaskError::invalid_argument("task_id"))
            }
            (Some(_), InvocationKind::Notification) => {
                Err(TaskError::invalid_argument("task_id"))
            }
            _ => Ok(()),
        }
    }
}

/// The user's request-to-handler registry, as seen from the bridge.
///
/// Payloads are serialized responses (JSON); the facade decodes them into
/// the caller's expected type.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Run the handler for a request and return its serialized response.
    /// Handlers without a response return an empty payload.
    async fn dispatch(&self, invocation: &BridgeInvocation) -> Result<Vec<u8>, TaskError>;

    /// Run every handler registered for a notification; any failure
    /// propagates.
    async fn publish(&self, invocation: &BridgeInvocation) -> Result<(), TaskError>;
}
