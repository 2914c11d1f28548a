pub mod coordinator;
pub mod distributed;
pub mod memory;
pub mod redis_store;
pub mod store;

use std::sync::Arc;

pub use coordinator::{TaskCoordinator, TaskOutcome};
pub use distributed::DistributedCoordinator;
pub use memory::InMemoryCoordinator;
pub use redis_store::RedisStore;
pub use store::{MemoryStore, RemoteStore, StoreError, Subscription};

use tether_types::{TaskError, TetherOptions};

/// Build the coordinator variant the options select.
///
/// Validates the options first, so no partially-configured coordinator is
/// ever observable. The distributed variant connects to the remote store at
/// `remote_store_endpoint`.
pub async fn coordinator_from_options(
    options: &TetherOptions,
) -> Result<Arc<dyn TaskCoordinator>, TaskError> {
    options.validate()?;
    if options.use_in_memory_coordination {
        Ok(Arc::new(InMemoryCoordinator::new(
            options.default_task_timeout,
        )))
    } else {
        let store = RedisStore::connect(&options.remote_store_endpoint).await?;
        Ok(Arc::new(DistributedCoordinator::new(
            store,
            options.remote_key_prefix.clone(),
            options.default_task_timeout,
        )))
    }
}
