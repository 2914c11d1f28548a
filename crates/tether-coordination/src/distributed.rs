//! Store-backed coordinator for multi-process deployments.
//!
//! Producer and consumer may be different hosts; the rendezvous lives in a
//! key/value + pub/sub store. Two orderings carry the protocol:
//!
//! - the worker stores the terminal record **before** publishing it, so a
//!   notification always implies a readable terminal key (modulo TTL);
//! - the waiter subscribes **before** reading the record, so a completion
//!   landing between its create and its wait is recovered from the key
//!   instead of being lost with the notification.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tether_types::envelope;
use tether_types::{ErrorKind, TaskError, TaskId, TaskRecord, TetherOptions};

use crate::coordinator::{TaskCoordinator, TaskOutcome};
use crate::store::{RemoteStore, StoreError};

/// Bounded internal retry for transient store failures.
const STORE_ATTEMPTS: u32 = 3;
const STORE_RETRY_BASE: Duration = Duration::from_millis(100);

async fn with_store_retry<T, Fut>(
    op: &str,
    mut attempt_fn: impl FnMut() -> Fut,
) -> Result<T, TaskError>
where
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 1u32;
    loop {
        match attempt_fn().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < STORE_ATTEMPTS => {
                debug!(op, attempt, error = %err, "transient store failure; retrying");
                time::sleep(STORE_RETRY_BASE * 2u32.pow(attempt - 1)).await;
                attempt += 1;
            }
            Err(err) => {
                return Err(TaskError::internal(format!(
                    "store {op} failed after {STORE_ATTEMPTS} attempts: {err}"
                )));
            }
        }
    }
}

/// Removes the waiter registration on every exit path.
struct WaiterGuard<'a> {
    waiters: &'a Mutex<HashSet<TaskId>>,
    task_id: TaskId,
}

impl<'a> WaiterGuard<'a> {
    fn register(waiters: &'a Mutex<HashSet<TaskId>>, task_id: &TaskId) -> Result<Self, TaskError> {
        let mut set = waiters.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !set.insert(task_id.clone()) {
            return Err(TaskError::new(
                ErrorKind::InvalidArgument,
                format!("task {task_id} already has an active waiter"),
            ));
        }
        Ok(Self {
            waiters,
            task_id: task_id.clone(),
        })
    }
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.waiters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.task_id);
    }
}

/// Distributed [`TaskCoordinator`] over any [`RemoteStore`].
///
/// Keyspace: `<prefix>task:<id>` holds the record (TTL = task timeout),
/// `<prefix>completion:<id>` carries the terminal envelope. Concurrent
/// waiters for one task id are rejected with `InvalidArgument`; the
/// process-local registry tracks which ids have an active waiter.
pub struct DistributedCoordinator<S> {
    store: S,
    key_prefix: String,
    task_timeout: Duration,
    waiters: Mutex<HashSet<TaskId>>,
}

impl<S: RemoteStore> DistributedCoordinator<S> {
    pub fn new(store: S, key_prefix: impl Into<String>, task_timeout: Duration) -> Self {
        Self {
            store,
            key_prefix: key_prefix.into(),
            task_timeout,
            waiters: Mutex::new(HashSet::new()),
        }
    }

    pub fn from_options(store: S, options: &TetherOptions) -> Result<Self, TaskError> {
        options.validate()?;
        Ok(Self::new(
            store,
            options.remote_key_prefix.clone(),
            options.default_task_timeout,
        ))
    }

    fn task_key(&self, task_id: &TaskId) -> String {
        format!("{}task:{task_id}", self.key_prefix)
    }

    fn completion_channel(&self, task_id: &TaskId) -> String {
        format!("{}completion:{task_id}", self.key_prefix)
    }
}

#[async_trait]
impl<S: RemoteStore> TaskCoordinator for DistributedCoordinator<S> {
    async fn create_task(&self, response_type: &str) -> Result<TaskId, TaskError> {
        let task_id = TaskId::generate();
        let record = TaskRecord::pending(task_id.clone(), response_type);
        let bytes = envelope::encode(&record)?;
        let key = self.task_key(&task_id);
        with_store_retry("set", || {
            self.store.set(&key, bytes.clone(), self.task_timeout)
        })
        .await?;
        Ok(task_id)
    }

    async fn complete_task(
        &self,
        task_id: &TaskId,
        outcome: TaskOutcome,
    ) -> Result<(), TaskError> {
        let key = self.task_key(task_id);
        let Some(bytes) = with_store_retry("get", || self.store.get(&key)).await? else {
            // The worker must never fail for a missing waiter.
            warn!(
                task_id = %task_id,
                "completion arrived for a missing task record (expired or cleaned up)"
            );
            return Ok(());
        };

        let mut record = envelope::decode_record(&bytes)?;
        let applied = match outcome {
            TaskOutcome::Success(payload) => record.complete(payload, Utc::now()),
            TaskOutcome::Failure(error) => record.fail(error, Utc::now()),
        };
        if !applied {
            debug!(task_id = %task_id, status = %record.status, "discarding completion for a terminal task");
            return Ok(());
        }

        let encoded = envelope::encode(&record)?;
        // Store first, then notify: a subscriber that sees the message is
        // guaranteed a readable terminal key, and a late subscriber that
        // missed the message recovers from the key.
        with_store_retry("set", || {
            self.store.set(&key, encoded.clone(), self.task_timeout)
        })
        .await?;
        let channel = self.completion_channel(task_id);
        with_store_retry("publish", || self.store.publish(&channel, encoded.clone())).await?;
        Ok(())
    }

    async fn wait_for_completion(
        &self,
        task_id: &TaskId,
        cancel: CancellationToken,
    ) -> Result<Vec<u8>, TaskError> {
        let _guard = WaiterGuard::register(&self.waiters, task_id)?;

        let channel = self.completion_channel(task_id);
        let mut subscription =
            with_store_retry("subscribe", || self.store.subscribe(&channel)).await?;

        let key = self.task_key(task_id);
        let Some(bytes) = with_store_retry("get", || self.store.get(&key)).await? else {
            return Err(TaskError::not_found(format!(
                "task {task_id} is not known to the coordinator"
            )));
        };
        let record = envelope::decode_record(&bytes)?;
        if record.is_terminal() {
            return envelope::into_payload(record);
        }

        let expected_type = record.response_type.clone();
        let elapsed = (Utc::now() - record.created_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        let deadline = time::sleep(self.task_timeout.saturating_sub(elapsed));
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                message = subscription.recv() => match message {
                    Some(bytes) => {
                        let terminal = envelope::decode(&bytes, &expected_type)?;
                        if terminal.task_id != *task_id || !terminal.is_terminal() {
                            continue;
                        }
                        return envelope::into_payload(terminal);
                    }
                    None => {
                        return Err(TaskError::internal(
                            "completion channel closed while waiting",
                        ));
                    }
                },
                () = &mut deadline => {
                    return Err(TaskError::timeout(format!(
                        "task {task_id} exceeded its deadline"
                    )));
                }
                () = cancel.cancelled() => {
                    return Err(TaskError::cancelled(format!(
                        "wait for task {task_id} cancelled by caller"
                    )));
                }
            }
        }
    }

    async fn cleanup_task(&self, task_id: &TaskId) -> Result<(), TaskError> {
        // Best effort: the TTL reclaims the record if the delete is lost.
        if let Err(err) = self.store.delete(&self.task_key(task_id)).await {
            warn!(task_id = %task_id, error = %err, "task cleanup failed; TTL will reclaim the record");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::store::{MemoryStore, Subscription};
    use tether_types::TaskStatus;

    use super::*;

    fn coordinator(store: MemoryStore, timeout: Duration) -> Arc<DistributedCoordinator<MemoryStore>> {
        Arc::new(DistributedCoordinator::new(store, "tether:", timeout))
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn completion_wakes_the_waiter_with_the_payload() {
        let coord = coordinator(MemoryStore::new(), Duration::from_secs(30));
        let task_id = coord.create_task("i64").await.unwrap();

        let waiter = {
            let coord = coord.clone();
            let task_id = task_id.clone();
            tokio::spawn(async move {
                coord
                    .wait_for_completion(&task_id, CancellationToken::new())
                    .await
            })
        };

        tokio::task::yield_now().await;
        coord
            .complete_task(&task_id, TaskOutcome::Success(b"41".to_vec()))
            .await
            .unwrap();

        assert_eq!(waiter.await.unwrap().unwrap(), b"41".to_vec());
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn completion_before_subscribe_is_recovered_from_the_key() {
        let coord = coordinator(MemoryStore::new(), Duration::from_secs(30));
        let task_id = coord.create_task("i64").await.unwrap();

        // The notification fires with nobody subscribed; the waiter must
        // still resolve from the stored terminal record.
        coord
            .complete_task(&task_id, TaskOutcome::Success(b"stored".to_vec()))
            .await
            .unwrap();

        let payload = coord
            .wait_for_completion(&task_id, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(payload, b"stored".to_vec());
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn only_the_first_completion_is_observable() {
        let coord = coordinator(MemoryStore::new(), Duration::from_secs(30));
        let task_id = coord.create_task("i64").await.unwrap();

        coord
            .complete_task(&task_id, TaskOutcome::Success(b"first".to_vec()))
            .await
            .unwrap();
        coord
            .complete_task(&task_id, TaskOutcome::Success(b"second".to_vec()))
            .await
            .unwrap();

        let payload = coord
            .wait_for_completion(&task_id, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(payload, b"first".to_vec());
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn completion_for_a_missing_record_succeeds_quietly() {
        let coord = coordinator(MemoryStore::new(), Duration::from_secs(30));
        coord
            .complete_task(&TaskId::generate(), TaskOutcome::Success(b"orphan".to_vec()))
            .await
            .unwrap();
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn failure_outcome_reconstructs_the_recorded_error() {
        let coord = coordinator(MemoryStore::new(), Duration::from_secs(30));
        let task_id = coord.create_task("i64").await.unwrap();
        coord
            .complete_task(
                &task_id,
                TaskOutcome::Failure(
                    TaskError::new(ErrorKind::HandlerFailed, "boom").with_origin("worker-2"),
                ),
            )
            .await
            .unwrap();

        let err = coord
            .wait_for_completion(&task_id, CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::HandlerFailed);
        assert_eq!(err.message, "boom");
        assert_eq!(err.origin.as_deref(), Some("worker-2"));
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn never_completed_task_times_out() {
        let coord = coordinator(MemoryStore::new(), Duration::from_millis(50));
        let task_id = coord.create_task("i64").await.unwrap();

        let err = coord
            .wait_for_completion(&task_id, CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn cancellation_interrupts_the_wait_and_leaves_the_record() {
        let store = MemoryStore::new();
        let coord = coordinator(store.clone(), Duration::from_secs(30));
        let task_id = coord.create_task("i64").await.unwrap();

        let cancel = CancellationToken::new();
        let waiter = {
            let coord = coord.clone();
            let task_id = task_id.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { coord.wait_for_completion(&task_id, cancel).await })
        };

        time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        let err = waiter.await.unwrap().unwrap_err();
        assert_eq!(err.kind, ErrorKind::Cancelled);

        // The record is still pending in the store; TTL reclaims it later.
        let bytes = store.get(&coord.task_key(&task_id)).await.unwrap().unwrap();
        let record = envelope::decode_record(&bytes).unwrap();
        assert_eq!(record.status, TaskStatus::Pending);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn a_second_concurrent_waiter_is_rejected() {
        let coord = coordinator(MemoryStore::new(), Duration::from_secs(30));
        let task_id = coord.create_task("i64").await.unwrap();

        let first = {
            let coord = coord.clone();
            let task_id = task_id.clone();
            tokio::spawn(async move {
                coord
                    .wait_for_completion(&task_id, CancellationToken::new())
                    .await
            })
        };
        tokio::task::yield_now().await;

        let err = coord
            .wait_for_completion(&task_id, CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);

        // Once the first waiter exits, the registration is released.
        coord
            .complete_task(&task_id, TaskOutcome::Success(b"done".to_vec()))
            .await
            .unwrap();
        assert_eq!(first.await.unwrap().unwrap(), b"done".to_vec());
        let payload = coord
            .wait_for_completion(&task_id, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(payload, b"done".to_vec());
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn unknown_task_is_not_found() {
        let coord = coordinator(MemoryStore::new(), Duration::from_secs(30));
        let err = coord
            .wait_for_completion(&TaskId::generate(), CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn cleanup_deletes_the_record_and_is_idempotent() {
        let store = MemoryStore::new();
        let coord = coordinator(store.clone(), Duration::from_secs(30));
        let task_id = coord.create_task("i64").await.unwrap();

        coord.cleanup_task(&task_id).await.unwrap();
        coord.cleanup_task(&task_id).await.unwrap();
        assert_eq!(store.get(&coord.task_key(&task_id)).await.unwrap(), None);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn record_expires_with_the_store_ttl() {
        let coord = coordinator(MemoryStore::new(), Duration::from_millis(50));
        let task_id = coord.create_task("i64").await.unwrap();

        time::sleep(Duration::from_millis(80)).await;
        let err = coord
            .wait_for_completion(&task_id, CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    /// Store wrapper that fails a configured number of reads before
    /// delegating, for exercising the bounded internal retry.
    struct FlakyStore {
        inner: MemoryStore,
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl RemoteStore for FlakyStore {
        async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError> {
            self.inner.set(key, value, ttl).await
        }

        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(StoreError::Unavailable("induced failure".into()));
            }
            self.inner.get(key).await
        }

        async fn delete(&self, key: &str) -> Result<(), StoreError> {
            self.inner.delete(key).await
        }

        async fn publish(&self, channel: &str, message: Vec<u8>) -> Result<(), StoreError> {
            self.inner.publish(channel, message).await
        }

        async fn subscribe(
            &self,
            channel: &str,
        ) -> Result<Box<dyn Subscription>, StoreError> {
            self.inner.subscribe(channel).await
        }
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn transient_store_failures_are_retried() {
        let store = FlakyStore {
            inner: MemoryStore::new(),
            failures_left: AtomicU32::new(2),
        };
        let coord = Arc::new(DistributedCoordinator::new(
            store,
            "tether:",
            Duration::from_secs(30),
        ));
        let task_id = coord.create_task("i64").await.unwrap();
        coord
            .complete_task(&task_id, TaskOutcome::Success(b"ok".to_vec()))
            .await
            .unwrap();
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn exhausted_store_retries_surface_as_internal() {
        let store = FlakyStore {
            inner: MemoryStore::new(),
            failures_left: AtomicU32::new(u32::MAX),
        };
        let coord = Arc::new(DistributedCoordinator::new(
            store,
            "tether:",
            Duration::from_secs(30),
        ));
        let task_id = coord.create_task("i64").await.unwrap();

        let err = coord
            .wait_for_completion(&task_id, CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::CoordinatorInternal);
    }
}
