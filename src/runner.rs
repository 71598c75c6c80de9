use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, Weak,
};

use crate::{
    api::{CohortApi, FlagConfigApi, HttpCohortApi, HttpFlagConfigApi},
    cohort_loader::{CohortLoader, CohortLoaderConfig},
    config::{CohortSyncConfig, SyncConfig},
    flag::cohort_ids_for_flags,
    scheduler::{Scheduler, TaskHandle},
    sse::{EventSource, HttpEventSource},
    storage::{CohortStorage, FlagConfigStorage, InMemoryCohortStorage, InMemoryFlagConfigStorage},
    updater::{
        fallback::FlagConfigFallbackRetryWrapper,
        poller::FlagConfigPoller,
        streamer::{FlagConfigStreamApi, FlagConfigStreamer},
        FlagConfigUpdater, FlagConfigUpdaterBase,
    },
    Result,
};

/// Where a [`DeploymentRunner`] gets its data from.
pub struct RunnerSources {
    pub flag_config_api: Arc<dyn FlagConfigApi>,
    /// Used only when stream updates are enabled.
    pub event_source: Option<Arc<dyn EventSource>>,
    /// Cohorts are only downloaded when set.
    pub cohort_api: Option<Arc<dyn CohortApi>>,
}

impl RunnerSources {
    /// HTTP sources for `config`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidUrl`](crate::Error::InvalidUrl) if a configured URL is invalid.
    /// - [`Error::Network`](crate::Error::Network) if an HTTP client could not be created.
    pub fn from_config(config: &SyncConfig) -> Result<RunnerSources> {
        let flag_config_api = Arc::new(HttpFlagConfigApi::new(
            &config.server_url,
            &config.deployment_key,
            config.flag_config_poller_request_timeout,
        )?);

        let event_source: Option<Arc<dyn EventSource>> = if config.stream_updates {
            Some(Arc::new(HttpEventSource::new(
                &config.stream_server_url,
                &config.deployment_key,
                config.stream_keepalive_timeout,
            )?))
        } else {
            None
        };

        let cohort_api: Option<Arc<dyn CohortApi>> = match &config.cohort_sync_config {
            Some(cohorts) => Some(Arc::new(HttpCohortApi::new(
                &cohorts.cohort_server_url,
                &cohorts.api_key,
                &cohorts.secret_key,
                cohorts.max_cohort_size,
                cohorts.request_timeout,
            )?)),
            None => None,
        };

        Ok(RunnerSources {
            flag_config_api,
            event_source,
            cohort_api,
        })
    }
}

/// Keeps the flag configurations and cohorts of one deployment up to date.
///
/// Streams flag configurations when stream updates are enabled, polling while the stream is
/// unavailable, and polls otherwise. Targeted cohorts are downloaded before the flags using them
/// are published and are refreshed periodically.
pub struct DeploymentRunner {
    flag_config_storage: Arc<InMemoryFlagConfigStorage>,
    cohort_storage: Arc<InMemoryCohortStorage>,
    cohort_loader: Option<Arc<CohortLoader>>,
    updater: Arc<dyn FlagConfigUpdater>,
    config: SyncConfig,
    scheduler: Scheduler,
    cohort_refresh: Mutex<Option<TaskHandle>>,
    stopped: AtomicBool,
}

impl DeploymentRunner {
    /// Create a runner talking to the servers configured in `config`. Nothing happens until
    /// [`start`](DeploymentRunner::start) is called.
    pub fn new(config: &SyncConfig) -> Result<DeploymentRunner> {
        Ok(DeploymentRunner::with_sources(
            config,
            RunnerSources::from_config(config)?,
        ))
    }

    pub fn with_sources(config: &SyncConfig, sources: RunnerSources) -> DeploymentRunner {
        let flag_config_storage = Arc::new(InMemoryFlagConfigStorage::new());
        let cohort_storage = Arc::new(InMemoryCohortStorage::new());

        let cohort_loader = sources.cohort_api.map(|api| {
            let loader_config = config
                .cohort_sync_config
                .as_ref()
                .map(|cohorts| cohorts.loader_config())
                .unwrap_or_else(CohortLoaderConfig::default);
            Arc::new(CohortLoader::new(
                api,
                Arc::clone(&cohort_storage) as Arc<dyn CohortStorage>,
                loader_config,
            ))
        });

        let base = FlagConfigUpdaterBase::new(
            Arc::clone(&flag_config_storage) as Arc<dyn FlagConfigStorage>,
            Arc::clone(&cohort_storage) as Arc<dyn CohortStorage>,
            cohort_loader.clone(),
        );
        let poller: Arc<dyn FlagConfigUpdater> = Arc::new(FlagConfigPoller::new(
            sources.flag_config_api,
            base.clone(),
            config.poller_config(),
        ));

        let updater = match sources.event_source.filter(|_| config.stream_updates) {
            Some(source) => {
                let stream_api = FlagConfigStreamApi::new(
                    source,
                    config.sse_config(),
                    config.stream_flag_conn_timeout,
                );
                let streamer: Arc<dyn FlagConfigUpdater> =
                    Arc::new(FlagConfigStreamer::new(stream_api, base));
                FlagConfigFallbackRetryWrapper::new(streamer, Some(poller), config.retry_config())
            }
            None => FlagConfigFallbackRetryWrapper::new(poller, None, config.retry_config()),
        };

        DeploymentRunner {
            flag_config_storage,
            cohort_storage,
            cohort_loader,
            updater: Arc::new(updater),
            config: config.clone(),
            scheduler: Scheduler::new("flagsync-cohort-refresh"),
            cohort_refresh: Mutex::new(None),
            stopped: AtomicBool::new(false),
        }
    }

    /// Load the initial flag configurations and start keeping them up to date.
    ///
    /// Blocks until the first set of flags (and the cohorts they target) has been stored.
    ///
    /// # Errors
    ///
    /// Returns the error of the initial load. Nothing keeps running in the background in that
    /// case.
    pub fn start(&self) -> Result<()> {
        log::info!(target: "flagsync", stream_updates = self.config.stream_updates; "starting deployment runner");
        self.updater.start(None)?;

        if let Some(loader) = &self.cohort_loader {
            let interval = self
                .config
                .cohort_sync_config
                .as_ref()
                .map_or(CohortSyncConfig::DEFAULT_POLLING_INTERVAL, |cohorts| {
                    cohorts.cohort_polling_interval
                });
            let loader: Weak<CohortLoader> = Arc::downgrade(loader);
            let flags = Arc::clone(&self.flag_config_storage);
            let task = self
                .scheduler
                .schedule_with_fixed_delay(interval, interval, move |handle| {
                    match loader.upgrade() {
                        Some(loader) => refresh_cohorts(&loader, &*flags),
                        None => handle.cancel(),
                    }
                })?;
            let previous = self
                .cohort_refresh
                .lock()
                .ok()
                .and_then(|mut slot| slot.replace(task));
            if let Some(previous) = previous {
                previous.cancel();
            }
        }
        Ok(())
    }

    /// Stop all background work. The runner cannot be restarted afterwards.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!(target: "flagsync", "stopping deployment runner");
        if let Some(task) = self.cohort_refresh.lock().ok().and_then(|mut slot| slot.take()) {
            task.cancel();
        }
        self.scheduler.shutdown();
        self.updater.shutdown();
        if let Some(loader) = &self.cohort_loader {
            loader.shutdown();
        }
    }

    /// Flag configurations as last received.
    pub fn flag_config_storage(&self) -> Arc<dyn FlagConfigStorage> {
        Arc::clone(&self.flag_config_storage) as Arc<dyn FlagConfigStorage>
    }

    /// Cohorts targeted by the stored flag configurations.
    pub fn cohort_storage(&self) -> Arc<dyn CohortStorage> {
        Arc::clone(&self.cohort_storage) as Arc<dyn CohortStorage>
    }
}

/// Reload every cohort targeted by the stored flags and wait for the loads to finish.
fn refresh_cohorts(loader: &CohortLoader, flags: &dyn FlagConfigStorage) {
    let snapshot = flags.get_flag_configs();
    let cohort_ids = cohort_ids_for_flags(snapshot.values().map(|flag| &**flag));
    log::debug!(target: "flagsync", count = cohort_ids.len(); "refreshing cohorts");

    let jobs: Vec<_> = cohort_ids
        .iter()
        .map(|cohort_id| loader.load_cohort(cohort_id))
        .collect();
    for job in jobs {
        if let Err(err) = job.wait() {
            log::warn!(target: "flagsync", cohort_id = job.cohort_id(); "cohort refresh failed: {err}");
        }
    }
}

impl Drop for DeploymentRunner {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{atomic::Ordering, Arc},
        time::Duration,
    };

    use super::{DeploymentRunner, RunnerSources};
    use crate::{
        cohort::CohortDownload,
        cohort_loader::tests::FakeCohortApi,
        config::{CohortSyncConfig, SyncConfig},
        flag::tests::flag_with_cohorts,
        sse::tests::{FakeEventSource, WAIT},
        storage::{tests::cohort, CohortStorage, FlagConfigStorage},
        updater::poller::tests::FakeFlagConfigApi,
        Error, StreamError,
    };

    fn test_config() -> SyncConfig {
        let mut config = SyncConfig::from_deployment_key("deployment-key");
        config
            .flag_config_poller_interval(Duration::from_millis(20))
            .retry_delay(Duration::from_millis(20), Duration::ZERO);
        config
    }

    #[test]
    fn start_fails_when_initial_poll_fails() {
        let api = FakeFlagConfigApi::new(vec![Err(Error::Unauthorized)]);
        let runner = DeploymentRunner::with_sources(
            &test_config(),
            RunnerSources {
                flag_config_api: api,
                event_source: None,
                cohort_api: None,
            },
        );

        assert!(matches!(runner.start(), Err(Error::Unauthorized)));
        runner.stop();
    }

    #[test]
    fn polls_flags_and_downloads_cohorts() {
        let api = FakeFlagConfigApi::new(vec![Ok(vec![flag_with_cohorts("flag", &["c1"])])]);
        let cohort_api = Arc::new(FakeCohortApi::new());
        cohort_api.respond("c1", Ok(CohortDownload::Updated(cohort("c1", 1, &["u1"]))));
        let mut config = test_config();
        config.cohort_sync_config(CohortSyncConfig::new("api", "secret"));

        let runner = DeploymentRunner::with_sources(
            &config,
            RunnerSources {
                flag_config_api: api,
                event_source: None,
                cohort_api: Some(cohort_api),
            },
        );
        runner.start().unwrap();

        assert!(runner.flag_config_storage().get_flag_config("flag").is_some());
        assert!(runner.cohort_storage().get_cohort("c1").is_some());
        runner.stop();
    }

    #[test]
    fn falls_back_to_polling_when_stream_is_unavailable() {
        let api = FakeFlagConfigApi::new(vec![Ok(vec![flag_with_cohorts("polled", &[])])]);
        let (source, _connections) = FakeEventSource::new();
        source.fail_next_open(StreamError::Status(503));
        let mut config = test_config();
        config
            .stream_updates(true)
            .retry_delay(Duration::from_secs(60), Duration::ZERO)
            .stream_flag_conn_timeout(WAIT);

        let runner = DeploymentRunner::with_sources(
            &config,
            RunnerSources {
                flag_config_api: api.clone(),
                event_source: Some(source.clone()),
                cohort_api: None,
            },
        );
        runner.start().unwrap();

        assert!(runner.flag_config_storage().get_flag_config("polled").is_some());
        assert_eq!(source.opens.load(Ordering::SeqCst), 1);
        assert!(api.calls.load(Ordering::SeqCst) >= 1);
        runner.stop();
    }
}
