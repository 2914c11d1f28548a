//! Single-process job engine.
//!
//! Runs invocations on the local tokio runtime: immediate jobs spawn right
//! away, scheduled jobs sleep first, and named recurring jobs live in a
//! registry and run on `trigger` (periodic cron firing is the business of a
//! full engine deployment; this one stores the expression and keeps the
//! semantics of the rest of the contract). Concurrency is bounded by a
//! semaphore, each job runs under the configured execution timeout, and a
//! periodic cleanup tick ages finished runs out of the retention window.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::error;
use uuid::Uuid;

use tether_coordination::TaskCoordinator;
use tether_types::{ErrorKind, TaskError, TetherOptions};

use crate::bridge::JobBridge;
use crate::dispatch::{BridgeInvocation, Dispatcher};
use crate::engine::{JobEngine, JobId, ScheduleTime};

/// Record of a finished job, retained per the configured policy.
#[derive(Clone, Debug)]
pub struct JobRun {
    pub job_id: JobId,
    pub display_name: String,
    pub error: Option<TaskError>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Clone)]
struct RecurringJob {
    invocation: BridgeInvocation,
    cron_expr: String,
    zone: Option<String>,
}

struct RetainedRun {
    run: JobRun,
    /// Retention deadline is measured on the monotonic clock.
    finished_at: Instant,
}

struct LocalEngineInner<D, C> {
    bridge: JobBridge<D, C>,
    limiter: Arc<Semaphore>,
    execution_timeout: Duration,
    retention_period: Duration,
    auto_delete_successful: bool,
    recurring: Mutex<HashMap<String, RecurringJob>>,
    runs: Mutex<VecDeque<RetainedRun>>,
}

impl<D, C> LocalEngineInner<D, C>
where
    D: Dispatcher + 'static,
    C: TaskCoordinator + 'static,
{
    fn lock_recurring(&self) -> MutexGuard<'_, HashMap<String, RecurringJob>> {
        self.recurring
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_runs(&self) -> MutexGuard<'_, VecDeque<RetainedRun>> {
        self.runs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn spawn_job(self: &Arc<Self>, invocation: BridgeInvocation, delay: Option<Duration>) -> JobId {
        let job_id: JobId = Uuid::new_v4().simple().to_string();
        let inner = Arc::clone(self);
        let id = job_id.clone();
        tokio::spawn(async move {
            if let Some(delay) = delay {
                time::sleep(delay).await;
            }
            let Ok(_permit) = inner.limiter.clone().acquire_owned().await else {
                return;
            };

            let display_name = invocation.display_name.clone();
            let result = match time::timeout(
                inner.execution_timeout,
                inner.bridge.execute(invocation),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(TaskError::new(
                    ErrorKind::HandlerFailed,
                    format!(
                        "job execution exceeded {}s",
                        inner.execution_timeout.as_secs()
                    ),
                )),
            };

            let error = result.err();
            if let Some(err) = &error {
                // Fire-and-forget failures have no rendezvous; this record
                // and the log line are their only trace.
                error!(job_id = %id, display_name = %display_name, error = %err, "job failed");
            }
            inner.record_run(JobRun {
                job_id: id,
                display_name,
                error,
                finished_at: Utc::now(),
            });
        });
        job_id
    }

    fn record_run(&self, run: JobRun) {
        if self.auto_delete_successful && run.error.is_none() {
            return;
        }
        self.lock_runs().push_back(RetainedRun {
            run,
            finished_at: Instant::now(),
        });
    }

    /// Drop retained runs that have outlived the retention window.
    ///
    /// Runs on the cleanup tick; the queue is push-back ordered, so ageing
    /// out stops at the first run still inside the window.
    fn prune_runs(&self) {
        let now = Instant::now();
        let retention = self.retention_period;
        let mut runs = self.lock_runs();
        while runs
            .front()
            .is_some_and(|retained| now >= retained.finished_at + retention)
        {
            runs.pop_front();
        }
    }
}

async fn run_cleanup<D, C>(inner: Weak<LocalEngineInner<D, C>>, period: Duration)
where
    D: Dispatcher + 'static,
    C: TaskCoordinator + 'static,
{
    let mut tick = time::interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tick.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.prune_runs();
    }
}

/// In-process [`JobEngine`] backed by [`JobBridge`].
pub struct LocalJobEngine<D, C> {
    inner: Arc<LocalEngineInner<D, C>>,
    cleanup: tokio::task::JoinHandle<()>,
}

impl<D, C> LocalJobEngine<D, C>
where
    D: Dispatcher + 'static,
    C: TaskCoordinator + 'static,
{
    /// Build an engine from validated options.
    ///
    /// Spawns the retention cleanup tick at `cleanup_interval`; the tick
    /// holds a weak reference so it cannot keep a dropped engine alive.
    pub fn new(bridge: JobBridge<D, C>, options: &TetherOptions) -> Result<Self, TaskError> {
        options.validate()?;
        let inner = Arc::new(LocalEngineInner {
            bridge,
            limiter: Arc::new(Semaphore::new(options.max_concurrent_jobs)),
            execution_timeout: options.job_execution_timeout,
            retention_period: options.job_retention_period,
            auto_delete_successful: options.auto_delete_successful_jobs,
            recurring: Mutex::new(HashMap::new()),
            runs: Mutex::new(VecDeque::new()),
        });
        let cleanup = tokio::spawn(run_cleanup(
            Arc::downgrade(&inner),
            options.cleanup_interval,
        ));
        Ok(Self { inner, cleanup })
    }

    /// Finished jobs still inside the retention window, oldest first.
    pub fn recent_runs(&self) -> Vec<JobRun> {
        self.inner
            .lock_runs()
            .iter()
            .map(|retained| retained.run.clone())
            .collect()
    }

    /// The stored `(cron_expr, zone)` for a registered recurring job.
    pub fn recurring_job(&self, name: &str) -> Option<(String, Option<String>)> {
        self.inner
            .lock_recurring()
            .get(name)
            .map(|job| (job.cron_expr.clone(), job.zone.clone()))
    }
}

impl<D, C> Drop for LocalJobEngine<D, C> {
    fn drop(&mut self) {
        self.cleanup.abort();
    }
}

#[async_trait]
impl<D, C> JobEngine for LocalJobEngine<D, C>
where
    D: Dispatcher + 'static,
    C: TaskCoordinator + 'static,
{
    async fn enqueue(&self, invocation: BridgeInvocation) -> Result<JobId, TaskError> {
        Ok(self.inner.spawn_job(invocation, None))
    }

    async fn schedule(
        &self,
        invocation: BridgeInvocation,
        when: ScheduleTime,
    ) -> Result<JobId, TaskError> {
        let delay = match when {
            ScheduleTime::Delay(delay) => delay,
            ScheduleTime::At(at) => (at - Utc::now()).to_std().unwrap_or(Duration::ZERO),
        };
        Ok(self.inner.spawn_job(invocation, Some(delay)))
    }

    async fn add_or_update(
        &self,
        name: &str,
        invocation: BridgeInvocation,
        cron_expr: &str,
        zone: Option<&str>,
    ) -> Result<(), TaskError> {
        if name.trim().is_empty() {
            return Err(TaskError::invalid_argument("name"));
        }
        if cron_expr.trim().is_empty() {
            return Err(TaskError::invalid_argument("cron_expr"));
        }
        invocation.validate()?;
        self.inner.lock_recurring().insert(
            name.to_string(),
            RecurringJob {
                invocation,
                cron_expr: cron_expr.to_string(),
                zone: zone.map(str::to_string),
            },
        );
        Ok(())
    }

    async fn trigger(&self, name: &str) -> Result<(), TaskError> {
        let invocation = {
            let recurring = self.inner.lock_recurring();
            let Some(job) = recurring.get(name) else {
                return Err(TaskError::not_found(format!(
                    "recurring job {name} is not registered"
                )));
            };
            job.invocation.clone()
        };
        self.inner.spawn_job(invocation, None);
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<(), TaskError> {
        self.inner.lock_recurring().remove(name);
        Ok(())
    }
}
