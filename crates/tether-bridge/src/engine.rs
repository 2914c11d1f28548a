use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use tether_types::TaskError;

use crate::dispatch::BridgeInvocation;

/// Opaque identifier the engine assigns to an accepted job.
pub type JobId = String;

/// When a scheduled job should run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScheduleTime {
    Delay(Duration),
    At(DateTime<Utc>),
}

/// The background-job engine, as consumed by the scheduler facade.
///
/// The engine must ship the invocation losslessly to some worker and run the
/// bridge entry point there. Everything else about it (persistence,
/// dashboards, its own retry policy for fire-and-forget failures) is its own
/// business.
#[async_trait]
pub trait JobEngine: Send + Sync {
    /// Run the invocation as soon as a worker is available.
    async fn enqueue(&self, invocation: BridgeInvocation) -> Result<JobId, TaskError>;

    /// Run the invocation at the requested time.
    async fn schedule(
        &self,
        invocation: BridgeInvocation,
        when: ScheduleTime,
    ) -> Result<JobId, TaskError>;

    /// Register or replace the named recurring job.
    async fn add_or_update(
        &self,
        name: &str,
        invocation: BridgeInvocation,
        cron_expr: &str,
        zone: Option<&str>,
    ) -> Result<(), TaskError>;

    /// Run the named recurring job now.
    async fn trigger(&self, name: &str) -> Result<(), TaskError>;

    /// Unregister the named recurring job. Removing an unknown name is not
    /// an error.
    async fn remove(&self, name: &str) -> Result<(), TaskError>;
}
