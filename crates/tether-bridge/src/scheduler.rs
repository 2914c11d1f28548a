//! User-facing facade.
//!
//! Thin mapping from user operations onto the job engine and the
//! coordinator. The one piece of real logic lives in
//! [`Scheduler::enqueue_with_result_cancellable`]: create the rendezvous,
//! enqueue the bridge invocation, await the rendezvous, and clean the task
//! up no matter how the wait ended.

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use tether_coordination::TaskCoordinator;
use tether_types::{TaskError, TaskId, TetherOptions};

use crate::dispatch::{BridgeInvocation, InvocationKind};
use crate::engine::{JobEngine, JobId, ScheduleTime};

pub struct Scheduler<E, C> {
    engine: Arc<E>,
    coordinator: Arc<C>,
    options: TetherOptions,
}

impl<E: JobEngine, C: TaskCoordinator> Scheduler<E, C> {
    /// Wire the facade up. Fails fast on invalid options.
    pub fn new(
        engine: Arc<E>,
        coordinator: Arc<C>,
        options: TetherOptions,
    ) -> Result<Self, TaskError> {
        options.validate()?;
        Ok(Self {
            engine,
            coordinator,
            options,
        })
    }

    fn invocation<Q: Serialize>(
        &self,
        display_name: &str,
        request: &Q,
        retry_budget: u32,
        kind: InvocationKind,
    ) -> Result<BridgeInvocation, TaskError> {
        let body = serde_json::to_vec(request)
            .map_err(|err| TaskError::serialization(format!("encode request: {err}")))?;
        let invocation = BridgeInvocation {
            display_name: display_name.to_string(),
            descriptor: std::any::type_name::<Q>().to_string(),
            body,
            task_id: None,
            retry_budget,
            kind,
        };
        invocation.validate()?;
        Ok(invocation)
    }

    /// Fire-and-forget immediate execution.
    ///
    /// Any response the handler produces is discarded; failures are the job
    /// engine's record, retried under its policy.
    pub async fn enqueue<Q: Serialize>(
        &self,
        display_name: &str,
        request: &Q,
    ) -> Result<JobId, TaskError> {
        let invocation = self.invocation(
            display_name,
            request,
            self.options.default_retry_budget,
            InvocationKind::Request,
        )?;
        self.engine.enqueue(invocation).await
    }

    /// Fire-and-forget notification fan-out.
    pub async fn publish<N: Serialize>(
        &self,
        display_name: &str,
        notification: &N,
    ) -> Result<JobId, TaskError> {
        let invocation = self.invocation(
            display_name,
            notification,
            self.options.default_retry_budget,
            InvocationKind::Notification,
        )?;
        self.engine.enqueue(invocation).await
    }

    /// Submit a request on the job engine and await its typed response.
    pub async fn enqueue_with_result<Q, R>(
        &self,
        display_name: &str,
        request: &Q,
        retry_budget: u32,
    ) -> Result<R, TaskError>
    where
        Q: Serialize,
        R: DeserializeOwned,
    {
        self.enqueue_with_result_cancellable(
            display_name,
            request,
            retry_budget,
            CancellationToken::new(),
        )
        .await
    }

    /// [`Self::enqueue_with_result`] with a caller cancel signal.
    ///
    /// Cancellation interrupts the wait only; the handler keeps running on
    /// its worker and the abandoned task is reclaimed by expiration.
    pub async fn enqueue_with_result_cancellable<Q, R>(
        &self,
        display_name: &str,
        request: &Q,
        retry_budget: u32,
        cancel: CancellationToken,
    ) -> Result<R, TaskError>
    where
        Q: Serialize,
        R: DeserializeOwned,
    {
        // Validate before any coordinator record or enqueue exists.
        let mut invocation =
            self.invocation(display_name, request, retry_budget, InvocationKind::Request)?;

        let task_id = self
            .coordinator
            .create_task(std::any::type_name::<R>())
            .await?;
        invocation.task_id = Some(task_id.clone());

        let result = self.submit_and_wait(invocation, &task_id, cancel).await;
        if let Err(err) = self.coordinator.cleanup_task(&task_id).await {
            warn!(task_id = %task_id, error = %err, "task cleanup failed");
        }
        result
    }

    async fn submit_and_wait<R: DeserializeOwned>(
        &self,
        invocation: BridgeInvocation,
        task_id: &TaskId,
        cancel: CancellationToken,
    ) -> Result<R, TaskError> {
        self.engine.enqueue(invocation).await?;
        let payload = self.coordinator.wait_for_completion(task_id, cancel).await?;
        serde_json::from_slice(&payload)
            .map_err(|err| TaskError::serialization(format!("decode response payload: {err}")))
    }

    /// Run the request at the given time. Delegates to the engine.
    pub async fn schedule<Q: Serialize>(
        &self,
        display_name: &str,
        request: &Q,
        when: ScheduleTime,
    ) -> Result<JobId, TaskError> {
        let invocation = self.invocation(
            display_name,
            request,
            self.options.default_retry_budget,
            InvocationKind::Request,
        )?;
        self.engine.schedule(invocation, when).await
    }

    /// Register or replace a named recurring job. Delegates to the engine.
    pub async fn add_or_update<Q: Serialize>(
        &self,
        name: &str,
        request: &Q,
        cron_expr: &str,
        zone: Option<&str>,
    ) -> Result<(), TaskError> {
        if name.trim().is_empty() {
            return Err(TaskError::invalid_argument("name"));
        }
        if cron_expr.trim().is_empty() {
            return Err(TaskError::invalid_argument("cron_expr"));
        }
        let invocation = self.invocation(
            name,
            request,
            self.options.default_retry_budget,
            InvocationKind::Request,
        )?;
        self.engine.add_or_update(name, invocation, cron_expr, zone).await
    }

    pub async fn trigger(&self, name: &str) -> Result<(), TaskError> {
        self.engine.trigger(name).await
    }

    pub async fn remove(&self, name: &str) -> Result<(), TaskError> {
        self.engine.remove(name).await
    }
}
