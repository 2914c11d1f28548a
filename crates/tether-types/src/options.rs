use std::time::Duration;

use crate::error::TaskError;

/// Configuration consumed by the coordinator, the bridge, and the scheduler
/// facade.
///
/// The recognized option set is closed; [`Self::validate`] fails fast with
/// `InvalidArgument` naming the offending field, and no component is
/// constructible from an options value that does not validate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TetherOptions {
    /// Select the single-process in-memory coordinator instead of the
    /// store-backed distributed one.
    pub use_in_memory_coordination: bool,
    /// Connection string for the remote store. Required when not in-memory.
    pub remote_store_endpoint: String,
    /// Namespace prefix for every coordinator key and channel.
    pub remote_key_prefix: String,
    /// Deadline for every response-bearing task, measured from creation.
    pub default_task_timeout: Duration,
    /// Additional handler attempts after the first failure. `0` means one
    /// attempt total.
    pub default_retry_budget: u32,
    /// Upper bound on jobs executing concurrently in the local engine.
    pub max_concurrent_jobs: usize,
    /// Wall-clock bound on a single job execution on a worker.
    pub job_execution_timeout: Duration,
    /// How long finished job outcomes are retained.
    pub job_retention_period: Duration,
    /// Period of retention cleanup in the job engine.
    pub cleanup_interval: Duration,
    /// Emit logs to the console subscriber.
    pub enable_console_logging: bool,
    /// Raise the console subscriber to debug verbosity.
    pub enable_detailed_logging: bool,
    /// Drop successful job outcomes immediately instead of retaining them.
    pub auto_delete_successful_jobs: bool,
}

impl TetherOptions {
    pub const DEFAULT_KEY_PREFIX: &'static str = "tether:";
    pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(30 * 60);
    pub const DEFAULT_JOB_EXECUTION_TIMEOUT: Duration = Duration::from_secs(60 * 60);
    pub const DEFAULT_JOB_RETENTION_PERIOD: Duration = Duration::from_secs(7 * 24 * 60 * 60);
    pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);

    /// Default concurrency bound: five jobs per available core.
    pub fn default_max_concurrent_jobs() -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            * 5
    }

    pub fn with_in_memory_coordination(mut self, enabled: bool) -> Self {
        self.use_in_memory_coordination = enabled;
        self
    }

    pub fn with_remote_store_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.remote_store_endpoint = endpoint.into();
        self
    }

    pub fn with_remote_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.remote_key_prefix = prefix.into();
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.default_task_timeout = timeout;
        self
    }

    pub fn with_retry_budget(mut self, budget: u32) -> Self {
        self.default_retry_budget = budget;
        self
    }

    pub fn with_max_concurrent_jobs(mut self, limit: usize) -> Self {
        self.max_concurrent_jobs = limit;
        self
    }

    pub fn with_job_execution_timeout(mut self, timeout: Duration) -> Self {
        self.job_execution_timeout = timeout;
        self
    }

    pub fn with_job_retention_period(mut self, period: Duration) -> Self {
        self.job_retention_period = period;
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    pub fn with_console_logging(mut self, enabled: bool) -> Self {
        self.enable_console_logging = enabled;
        self
    }

    pub fn with_detailed_logging(mut self, enabled: bool) -> Self {
        self.enable_detailed_logging = enabled;
        self
    }

    pub fn with_auto_delete_successful_jobs(mut self, enabled: bool) -> Self {
        self.auto_delete_successful_jobs = enabled;
        self
    }

    /// Fail fast on the first invalid field, naming it.
    ///
    /// The retry budget needs no check: the type already rules out negative
    /// values.
    pub fn validate(&self) -> Result<(), TaskError> {
        if !self.use_in_memory_coordination && self.remote_store_endpoint.is_empty() {
            return Err(TaskError::invalid_argument("remote_store_endpoint"));
        }
        if self.remote_key_prefix.is_empty() {
            return Err(TaskError::invalid_argument("remote_key_prefix"));
        }
        if self.default_task_timeout.is_zero() {
            return Err(TaskError::invalid_argument("default_task_timeout"));
        }
        if self.max_concurrent_jobs == 0 {
            return Err(TaskError::invalid_argument("max_concurrent_jobs"));
        }
        if self.job_execution_timeout.is_zero() {
            return Err(TaskError::invalid_argument("job_execution_timeout"));
        }
        if self.job_retention_period.is_zero() {
            return Err(TaskError::invalid_argument("job_retention_period"));
        }
        if self.cleanup_interval.is_zero() {
            return Err(TaskError::invalid_argument("cleanup_interval"));
        }
        Ok(())
    }
}

impl Default for TetherOptions {
    fn default() -> Self {
        Self {
            use_in_memory_coordination: false,
            remote_store_endpoint: String::new(),
            remote_key_prefix: Self::DEFAULT_KEY_PREFIX.to_string(),
            default_task_timeout: Self::DEFAULT_TASK_TIMEOUT,
            default_retry_budget: 0,
            max_concurrent_jobs: Self::default_max_concurrent_jobs(),
            job_execution_timeout: Self::DEFAULT_JOB_EXECUTION_TIMEOUT,
            job_retention_period: Self::DEFAULT_JOB_RETENTION_PERIOD,
            cleanup_interval: Self::DEFAULT_CLEANUP_INTERVAL,
            enable_console_logging: true,
            enable_detailed_logging: false,
            auto_delete_successful_jobs: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::error::ErrorKind;

    use super::*;

    fn in_memory() -> TetherOptions {
        TetherOptions::default().with_in_memory_coordination(true)
    }

    #[test]
    fn defaults_validate_once_an_endpoint_is_supplied() {
        assert!(in_memory().validate().is_ok());
        assert!(
            TetherOptions::default()
                .with_remote_store_endpoint("redis://127.0.0.1:6379")
                .validate()
                .is_ok()
        );
    }

    #[test]
    fn missing_endpoint_is_rejected_by_field_name() {
        let err = TetherOptions::default().validate().unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
        assert_eq!(err.message, "remote_store_endpoint");
    }

    #[test]
    fn zero_durations_and_counts_are_rejected() {
        let cases: [(TetherOptions, &str); 5] = [
            (in_memory().with_task_timeout(Duration::ZERO), "default_task_timeout"),
            (in_memory().with_max_concurrent_jobs(0), "max_concurrent_jobs"),
            (
                in_memory().with_job_execution_timeout(Duration::ZERO),
                "job_execution_timeout",
            ),
            (
                in_memory().with_job_retention_period(Duration::ZERO),
                "job_retention_period",
            ),
            (in_memory().with_cleanup_interval(Duration::ZERO), "cleanup_interval"),
        ];
        for (options, field) in cases {
            let err = options.validate().unwrap_err();
            assert_eq!(err.kind, ErrorKind::InvalidArgument);
            assert_eq!(err.message, field);
        }
    }

    #[test]
    fn empty_key_prefix_is_rejected() {
        let err = in_memory().with_remote_key_prefix("").validate().unwrap_err();
        assert_eq!(err.message, "remote_key_prefix");
    }

    #[test]
    fn default_concurrency_tracks_available_parallelism() {
        assert!(TetherOptions::default().max_concurrent_jobs >= 5);
    }
}
