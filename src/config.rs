use std::time::Duration;

use crate::{
    assignment::{AnalyticsSink, AssignmentService},
    backoff::BackoffConfig,
    cohort_loader::CohortLoaderConfig,
    sse::SseConfig,
    updater::{fallback::RetryConfig, poller::PollerConfig, streamer::FlagConfigStreamApi},
    DeploymentRunner, Result,
};

/// Configuration for [`DeploymentRunner`](crate::DeploymentRunner).
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub(crate) deployment_key: String,
    pub(crate) server_url: String,
    pub(crate) stream_server_url: String,
    pub(crate) flag_config_poller_interval: Duration,
    pub(crate) flag_config_poller_request_timeout: Duration,
    pub(crate) stream_updates: bool,
    pub(crate) stream_flag_conn_timeout: Duration,
    pub(crate) stream_keepalive_timeout: Duration,
    pub(crate) stream_reconnect_interval: Duration,
    pub(crate) stream_reconnect_jitter: Duration,
    pub(crate) retry_delay: Duration,
    pub(crate) retry_jitter: Duration,
    pub(crate) cohort_sync_config: Option<CohortSyncConfig>,
    pub(crate) assignment_config: Option<AssignmentConfig>,
}

impl SyncConfig {
    /// Create a default configuration using the specified deployment key.
    ///
    /// ```
    /// # use flagsync::SyncConfig;
    /// SyncConfig::from_deployment_key("server-deployment-key");
    /// ```
    pub fn from_deployment_key(deployment_key: impl Into<String>) -> Self {
        SyncConfig {
            deployment_key: deployment_key.into(),
            server_url: SyncConfig::DEFAULT_SERVER_URL.to_owned(),
            stream_server_url: SyncConfig::DEFAULT_STREAM_SERVER_URL.to_owned(),
            flag_config_poller_interval: PollerConfig::DEFAULT_INTERVAL,
            flag_config_poller_request_timeout: SyncConfig::DEFAULT_REQUEST_TIMEOUT,
            stream_updates: false,
            stream_flag_conn_timeout: FlagConfigStreamApi::DEFAULT_CONN_TIMEOUT,
            stream_keepalive_timeout: SseConfig::DEFAULT_KEEPALIVE_TIMEOUT,
            stream_reconnect_interval: SseConfig::DEFAULT_RECONNECT_INTERVAL,
            stream_reconnect_jitter: SseConfig::DEFAULT_RECONNECT_JITTER,
            retry_delay: RetryConfig::DEFAULT_RETRY_DELAY,
            retry_jitter: RetryConfig::DEFAULT_RETRY_JITTER,
            cohort_sync_config: None,
            assignment_config: None,
        }
    }

    /// Default base URL for flag configuration requests.
    pub const DEFAULT_SERVER_URL: &'static str = "https://api.lab.amplitude.com";

    /// Default base URL for the flag configuration stream.
    pub const DEFAULT_STREAM_SERVER_URL: &'static str = "https://stream.lab.amplitude.com";

    pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

    /// Override base URL for flag configuration requests. Clients should use the default setting
    /// in most cases.
    pub fn server_url(&mut self, server_url: impl Into<String>) -> &mut Self {
        self.server_url = server_url.into();
        self
    }

    /// Override base URL for the flag configuration stream.
    pub fn stream_server_url(&mut self, stream_server_url: impl Into<String>) -> &mut Self {
        self.stream_server_url = stream_server_url.into();
        self
    }

    pub fn flag_config_poller_interval(&mut self, interval: Duration) -> &mut Self {
        self.flag_config_poller_interval = interval;
        self
    }

    pub fn flag_config_poller_request_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.flag_config_poller_request_timeout = timeout;
        self
    }

    /// Receive flag configuration updates over a stream instead of polling. Polling is still used
    /// while the stream is unavailable.
    ///
    /// ```
    /// # use flagsync::SyncConfig;
    /// let mut config = SyncConfig::from_deployment_key("server-deployment-key");
    /// config.stream_updates(true);
    /// ```
    pub fn stream_updates(&mut self, stream_updates: bool) -> &mut Self {
        self.stream_updates = stream_updates;
        self
    }

    /// How long to wait for the first stream frame before the stream counts as failed.
    pub fn stream_flag_conn_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.stream_flag_conn_timeout = timeout;
        self
    }

    pub fn stream_keepalive_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.stream_keepalive_timeout = timeout;
        self
    }

    pub fn stream_reconnect_interval(&mut self, interval: Duration, jitter: Duration) -> &mut Self {
        self.stream_reconnect_interval = interval;
        self.stream_reconnect_jitter = jitter;
        self
    }

    /// Delay between attempts to restore the preferred update strategy after it failed.
    pub fn retry_delay(&mut self, delay: Duration, jitter: Duration) -> &mut Self {
        self.retry_delay = delay;
        self.retry_jitter = jitter;
        self
    }

    /// Enable downloading the cohorts targeted by flags.
    pub fn cohort_sync_config(&mut self, cohort_sync_config: CohortSyncConfig) -> &mut Self {
        self.cohort_sync_config = Some(cohort_sync_config);
        self
    }

    /// Enable assignment tracking.
    pub fn assignment_config(&mut self, assignment_config: AssignmentConfig) -> &mut Self {
        self.assignment_config = Some(assignment_config);
        self
    }

    /// Create a new [`DeploymentRunner`] using this configuration.
    ///
    /// ```no_run
    /// # use flagsync::SyncConfig;
    /// let runner = SyncConfig::from_deployment_key("server-deployment-key").to_runner()?;
    /// runner.start()?;
    /// # Ok::<(), flagsync::Error>(())
    /// ```
    pub fn to_runner(&self) -> Result<DeploymentRunner> {
        DeploymentRunner::new(self)
    }

    /// Create an [`AssignmentService`] sending events to `sink`. Returns `None` if assignment
    /// tracking is not configured.
    pub fn to_assignment_service(
        &self,
        sink: impl AnalyticsSink + Send + Sync + 'static,
    ) -> Option<AssignmentService> {
        self.assignment_config
            .as_ref()
            .map(|config| AssignmentService::new(config, sink))
    }

    pub(crate) fn poller_config(&self) -> PollerConfig {
        PollerConfig {
            interval: self.flag_config_poller_interval,
        }
    }

    pub(crate) fn sse_config(&self) -> SseConfig {
        SseConfig {
            keepalive_timeout: self.stream_keepalive_timeout,
            reconnect_interval: self.stream_reconnect_interval,
            reconnect_jitter: self.stream_reconnect_jitter,
        }
    }

    pub(crate) fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            retry_delay: self.retry_delay,
            retry_jitter: self.retry_jitter,
            fallback_retry_delay: self.retry_delay,
            fallback_retry_jitter: self.retry_jitter,
        }
    }
}

/// Credentials and settings for cohort downloads.
#[derive(Debug, Clone)]
pub struct CohortSyncConfig {
    pub api_key: String,
    pub secret_key: String,
    /// Cohorts with more members than this are not downloaded.
    pub max_cohort_size: usize,
    pub cohort_server_url: String,
    /// Interval between refreshes of all stored cohorts.
    pub cohort_polling_interval: Duration,
    pub request_timeout: Duration,
    /// Number of concurrent cohort downloads.
    pub worker_threads: usize,
    pub backoff: BackoffConfig,
}

impl CohortSyncConfig {
    pub const DEFAULT_COHORT_SERVER_URL: &'static str = "https://cohort-v2.lab.amplitude.com";
    pub const DEFAULT_MAX_COHORT_SIZE: usize = i32::MAX as usize;
    pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(60);

    pub fn new(api_key: impl Into<String>, secret_key: impl Into<String>) -> CohortSyncConfig {
        CohortSyncConfig {
            api_key: api_key.into(),
            secret_key: secret_key.into(),
            max_cohort_size: CohortSyncConfig::DEFAULT_MAX_COHORT_SIZE,
            cohort_server_url: CohortSyncConfig::DEFAULT_COHORT_SERVER_URL.to_owned(),
            cohort_polling_interval: CohortSyncConfig::DEFAULT_POLLING_INTERVAL,
            request_timeout: SyncConfig::DEFAULT_REQUEST_TIMEOUT,
            worker_threads: CohortLoaderConfig::DEFAULT_WORKER_THREADS,
            backoff: BackoffConfig::default(),
        }
    }

    pub(crate) fn loader_config(&self) -> CohortLoaderConfig {
        CohortLoaderConfig {
            worker_threads: self.worker_threads,
            backoff: self.backoff.clone(),
        }
    }
}

/// Settings for assignment event deduplication.
#[derive(Debug, Clone)]
pub struct AssignmentConfig {
    /// Maximum number of distinct assignments remembered.
    pub cache_capacity: usize,
    /// How long an assignment is remembered. `None` keeps entries until they are evicted.
    pub ttl: Option<Duration>,
}

impl AssignmentConfig {
    pub const DEFAULT_CACHE_CAPACITY: usize = 65536;
    pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);
}

impl Default for AssignmentConfig {
    fn default() -> AssignmentConfig {
        AssignmentConfig {
            cache_capacity: AssignmentConfig::DEFAULT_CACHE_CAPACITY,
            ttl: Some(AssignmentConfig::DEFAULT_TTL),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{AssignmentConfig, CohortSyncConfig, SyncConfig};

    #[test]
    fn defaults() {
        let config = SyncConfig::from_deployment_key("key");
        assert_eq!(config.server_url, SyncConfig::DEFAULT_SERVER_URL);
        assert_eq!(config.flag_config_poller_interval, Duration::from_secs(30));
        assert_eq!(config.stream_flag_conn_timeout, Duration::from_millis(1500));
        assert_eq!(config.stream_keepalive_timeout, Duration::from_secs(17));
        assert_eq!(config.retry_delay, Duration::from_secs(15));
        assert!(!config.stream_updates);
        assert!(config.cohort_sync_config.is_none());

        let cohorts = CohortSyncConfig::new("api", "secret");
        assert_eq!(cohorts.cohort_polling_interval, Duration::from_secs(60));
        assert_eq!(cohorts.worker_threads, 4);

        let assignment = AssignmentConfig::default();
        assert_eq!(assignment.cache_capacity, 65536);
        assert_eq!(assignment.ttl, Some(Duration::from_secs(86400)));
    }

    #[test]
    fn builder_overrides() {
        let mut config = SyncConfig::from_deployment_key("key");
        config
            .server_url("http://localhost:8080")
            .stream_updates(true)
            .retry_delay(Duration::from_secs(1), Duration::ZERO)
            .cohort_sync_config(CohortSyncConfig::new("api", "secret"));

        assert_eq!(config.server_url, "http://localhost:8080");
        assert!(config.stream_updates);
        assert_eq!(config.retry_config().fallback_retry_delay, Duration::from_secs(1));
        assert!(config.cohort_sync_config.is_some());
    }
}
