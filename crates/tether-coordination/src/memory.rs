//! Single-process coordinator.
//!
//! Rendezvous without durability: task records live in a shared map, each
//! paired with a `watch` channel acting as the exactly-once completion slot.
//! `watch` retains the latest value, so a waiter that subscribes after the
//! terminal transition still resolves, and cleanup under a suspended waiter
//! merely unlinks the record.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use tether_types::{TaskError, TaskId, TaskRecord, TetherOptions};

use crate::coordinator::{TaskCoordinator, TaskOutcome};

/// Value latched into a completion slot at the terminal transition.
type Terminal = Result<Vec<u8>, TaskError>;

struct TaskSlot {
    record: TaskRecord,
    slot: watch::Sender<Option<Terminal>>,
    /// Deadline on the monotonic clock: `created + task_timeout`.
    deadline: Instant,
    /// Set at the terminal transition; drives sweeper reclamation.
    terminal_at: Option<Instant>,
}

struct MemoryInner {
    tasks: Mutex<HashMap<TaskId, TaskSlot>>,
    task_timeout: Duration,
    sweep_period: Duration,
}

impl MemoryInner {
    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, HashMap<TaskId, TaskSlot>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Force `Pending -> Failed(Timeout)` if the deadline has genuinely won
    /// the race; a completion that landed first stays untouched.
    fn force_timeout(&self, task_id: &TaskId) {
        let mut tasks = self.lock_tasks();
        let Some(slot) = tasks.get_mut(task_id) else {
            return;
        };
        if slot.record.is_terminal() {
            return;
        }
        let error = TaskError::timeout(format!("task {task_id} exceeded its deadline"));
        slot.record.fail(error.clone(), Utc::now());
        slot.terminal_at = Some(Instant::now());
        slot.slot.send_replace(Some(Err(error)));
        debug!(task_id = %task_id, "pending task timed out");
    }

    fn sweep(&self) {
        let now = Instant::now();
        let mut tasks = self.lock_tasks();
        for (task_id, slot) in tasks.iter_mut() {
            if slot.record.is_terminal() || now < slot.deadline {
                continue;
            }
            let error = TaskError::timeout(format!("task {task_id} exceeded its deadline"));
            slot.record.fail(error.clone(), Utc::now());
            slot.terminal_at = Some(Instant::now());
            slot.slot.send_replace(Some(Err(error)));
            debug!(task_id = %task_id, "sweeper timed out a pending task");
        }
        let period = self.sweep_period;
        tasks.retain(|_, slot| match slot.terminal_at {
            Some(at) => now < at + period,
            None => true,
        });
    }
}

/// In-memory [`TaskCoordinator`] for single-process deployments.
pub struct InMemoryCoordinator {
    inner: Arc<MemoryInner>,
    sweeper: tokio::task::JoinHandle<()>,
}

impl InMemoryCoordinator {
    /// Build a coordinator enforcing `task_timeout` on every task.
    ///
    /// Spawns the periodic sweeper; the sweep period is
    /// `min(1 minute, task_timeout / 4)`.
    pub fn new(task_timeout: Duration) -> Self {
        let sweep_period = (task_timeout / 4).min(Duration::from_secs(60));
        let inner = Arc::new(MemoryInner {
            tasks: Mutex::new(HashMap::new()),
            task_timeout,
            sweep_period,
        });

        let weak = Arc::downgrade(&inner);
        let sweeper = tokio::spawn(run_sweeper(weak, sweep_period));

        Self { inner, sweeper }
    }

    pub fn from_options(options: &TetherOptions) -> Result<Self, TaskError> {
        options.validate()?;
        Ok(Self::new(options.default_task_timeout))
    }
}

impl Drop for InMemoryCoordinator {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}

async fn run_sweeper(inner: Weak<MemoryInner>, period: Duration) {
    let mut tick = time::interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tick.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.sweep();
    }
}

#[async_trait]
impl TaskCoordinator for InMemoryCoordinator {
    async fn create_task(&self, response_type: &str) -> Result<TaskId, TaskError> {
        let task_id = TaskId::generate();
        let record = TaskRecord::pending(task_id.clone(), response_type);
        let (slot, _) = watch::channel(None);
        let deadline = Instant::now() + self.inner.task_timeout;

        self.inner.lock_tasks().insert(
            task_id.clone(),
            TaskSlot {
                record,
                slot,
                deadline,
                terminal_at: None,
            },
        );

        // Deadline enforcement must not keep the coordinator alive, so the
        // timer holds a weak reference.
        let weak = Arc::downgrade(&self.inner);
        let timeout = self.inner.task_timeout;
        let timer_id = task_id.clone();
        tokio::spawn(async move {
            time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                inner.force_timeout(&timer_id);
            }
        });

        Ok(task_id)
    }

    async fn complete_task(
        &self,
        task_id: &TaskId,
        outcome: TaskOutcome,
    ) -> Result<(), TaskError> {
        let mut tasks = self.inner.lock_tasks();
        let Some(slot) = tasks.get_mut(task_id) else {
            debug!(task_id = %task_id, "discarding completion for an unknown task");
            return Ok(());
        };

        let terminal = match outcome {
            TaskOutcome::Success(payload) => {
                if !slot.record.complete(payload.clone(), Utc::now()) {
                    debug!(task_id = %task_id, "discarding completion for a terminal task");
                    return Ok(());
                }
                Ok(payload)
            }
            TaskOutcome::Failure(error) => {
                if !slot.record.fail(error.clone(), Utc::now()) {
                    debug!(task_id = %task_id, "discarding completion for a terminal task");
                    return Ok(());
                }
                Err(error)
            }
        };

        slot.terminal_at = Some(Instant::now());
        slot.slot.send_replace(Some(terminal));
        Ok(())
    }

    async fn wait_for_completion(
        &self,
        task_id: &TaskId,
        cancel: CancellationToken,
    ) -> Result<Vec<u8>, TaskError> {
        let (mut rx, deadline) = {
            let tasks = self.inner.lock_tasks();
            let Some(slot) = tasks.get(task_id) else {
                return Err(TaskError::not_found(format!(
                    "task {task_id} is not known to the coordinator"
                )));
            };
            (slot.slot.subscribe(), slot.deadline)
        };

        tokio::select! {
            resolved = rx.wait_for(|terminal| terminal.is_some()) => match resolved {
                Ok(terminal) => match terminal.clone() {
                    Some(outcome) => outcome,
                    None => Err(TaskError::internal("completion slot resolved without a value")),
                },
                Err(_) => Err(TaskError::not_found(format!(
                    "task {task_id} was removed while waiting"
                ))),
            },
            () = time::sleep_until(deadline) => {
                Err(TaskError::timeout(format!("task {task_id} exceeded its deadline")))
            }
            () = cancel.cancelled() => {
                Err(TaskError::cancelled(format!("wait for task {task_id} cancelled by caller")))
            }
        }
    }

    async fn cleanup_task(&self, task_id: &TaskId) -> Result<(), TaskError> {
        self.inner.lock_tasks().remove(task_id);
        Ok(())
    }
}
