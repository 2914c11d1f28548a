//! Worker-side entry point.
//!
//! The job engine invokes [`JobBridge::execute`] with the shipped
//! invocation. The bridge runs the handler under a bounded retry loop and
//! owns the asymmetry between the two submission shapes: response-bearing
//! jobs always deliver a terminal envelope to the coordinator (raising would
//! stack the engine's own retry policy on top and multiply execution), while
//! fire-and-forget failures re-raise so the engine is the record.

use std::sync::Arc;
use std::time::Duration;

use tokio::time;
use tracing::warn;

use tether_coordination::{TaskCoordinator, TaskOutcome};
use tether_types::{ErrorKind, TaskError};

use crate::dispatch::{BridgeInvocation, Dispatcher, InvocationKind};

pub struct JobBridge<D, C> {
    dispatcher: Arc<D>,
    coordinator: Arc<C>,
    backoff_base: Duration,
    backoff_cap: Duration,
}

impl<D: Dispatcher, C: TaskCoordinator> JobBridge<D, C> {
    pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);
    /// Cap on the exponential schedule, so large retry budgets cannot
    /// produce pathological delays.
    pub const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(30);

    pub fn new(dispatcher: Arc<D>, coordinator: Arc<C>) -> Self {
        Self {
            dispatcher,
            coordinator,
            backoff_base: Self::DEFAULT_BACKOFF_BASE,
            backoff_cap: Self::DEFAULT_BACKOFF_CAP,
        }
    }

    pub fn with_backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_cap = cap;
        self
    }

    /// Delay before the attempt following `failed_attempt`:
    /// `base * 2^(n-1)`, capped.
    fn backoff_delay(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1).min(31);
        self.backoff_base
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.backoff_cap)
    }

    /// Run one shipped invocation to a terminal outcome.
    ///
    /// Returns `Ok` whenever the outcome was delivered to the coordinator
    /// (including handler exhaustion); returns `Err` only when the engine
    /// itself should record the failure.
    pub async fn execute(&self, invocation: BridgeInvocation) -> Result<(), TaskError> {
        if let Err(err) = invocation.validate() {
            // With a usable rendezvous the validation verdict still goes
            // into the envelope; otherwise the waiter would hang until its
            // deadline.
            return match &invocation.task_id {
                Some(task_id) if !task_id.is_empty() => {
                    self.coordinator
                        .complete_task(task_id, TaskOutcome::Failure(err))
                        .await?;
                    Ok(())
                }
                _ => Err(err),
            };
        }

        let max_attempts = invocation.retry_budget.saturating_add(1);
        let mut attempt = 1u32;
        let failure = loop {
            let dispatched = match invocation.kind {
                InvocationKind::Request => self.dispatcher.dispatch(&invocation).await,
                InvocationKind::Notification => self
                    .dispatcher
                    .publish(&invocation)
                    .await
                    .map(|()| Vec::new()),
            };
            match dispatched {
                Ok(payload) => {
                    if let Some(task_id) = &invocation.task_id {
                        self.coordinator
                            .complete_task(task_id, TaskOutcome::Success(payload))
                            .await?;
                    }
                    return Ok(());
                }
                Err(err) if attempt < max_attempts => {
                    let delay = self.backoff_delay(attempt);
                    warn!(
                        display_name = %invocation.display_name,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "handler attempt failed; backing off"
                    );
                    time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => break err,
            }
        };

        match &invocation.task_id {
            Some(task_id) => {
                let origin = failure.origin.clone().unwrap_or_else(|| {
                    format!("{} after {attempt} attempt(s)", invocation.display_name)
                });
                let error = TaskError::new(ErrorKind::HandlerFailed, failure.message.clone())
                    .with_origin(origin);
                self.coordinator
                    .complete_task(task_id, TaskOutcome::Failure(error))
                    .await?;
                Ok(())
            }
            None => Err(failure),
        }
    }
}
