//! Strategies that keep flag configurations (and the cohorts they reference) up to date.
//!
//! All strategies implement [`FlagConfigUpdater`]:
//! - [`FlagConfigPoller`](poller::FlagConfigPoller) periodically pulls a full snapshot.
//! - [`FlagConfigStreamer`](streamer::FlagConfigStreamer) receives snapshots pushed over a stream.
//! - [`FlagConfigFallbackRetryWrapper`](fallback::FlagConfigFallbackRetryWrapper) combines a main
//!   and a fallback updater and keeps retrying the main one.
use std::{
    any::Any,
    collections::{HashMap, HashSet},
    sync::Arc,
};

use crate::{
    cohort_loader::{CohortLoader, Job},
    flag::{cohort_ids_for_flags, FlagConfig},
    storage::{CohortStorage, FlagConfigStorage},
    Error, Result,
};

pub mod fallback;
pub mod poller;
pub mod streamer;

/// Callback invoked when a started updater fails in the background.
pub type ErrorCallback = Arc<dyn Fn(Error) + Send + Sync>;

/// Common contract of flag configuration update strategies.
pub trait FlagConfigUpdater: Send + Sync + 'static {
    /// Start delivering flag configurations.
    ///
    /// Fails synchronously if the initial fetch (or connection) fails, in which case nothing is
    /// scheduled in the background. Once started, failures are reported through `on_error` only,
    /// at most once per failure; the updater stops itself before invoking it.
    ///
    /// May be called again after [`stop`](FlagConfigUpdater::stop).
    fn start(&self, on_error: Option<ErrorCallback>) -> Result<()>;

    /// Pause background delivery. Safe to call when already stopped.
    fn stop(&self);

    /// Stop permanently and release background resources. `start` must not be called afterwards.
    fn shutdown(&self);

    /// Used to inspect the concrete updater type.
    fn as_any(&self) -> &dyn Any;
}

/// Applies a new flag configuration snapshot: downloads missing cohorts, publishes flags and
/// removes flags and cohorts that are no longer needed.
#[derive(Clone)]
pub struct FlagConfigUpdaterBase {
    flag_config_storage: Arc<dyn FlagConfigStorage>,
    cohort_storage: Arc<dyn CohortStorage>,
    cohort_loader: Option<Arc<CohortLoader>>,
}

impl FlagConfigUpdaterBase {
    pub fn new(
        flag_config_storage: Arc<dyn FlagConfigStorage>,
        cohort_storage: Arc<dyn CohortStorage>,
        cohort_loader: Option<Arc<CohortLoader>>,
    ) -> FlagConfigUpdaterBase {
        FlagConfigUpdaterBase {
            flag_config_storage,
            cohort_storage,
            cohort_loader,
        }
    }

    /// Apply `flags` as the new complete set of flag configurations.
    ///
    /// Flags whose cohorts are all present are published immediately. Flags referencing missing
    /// cohorts are published once the loads for those cohorts finish, whether they succeeded or
    /// not. Blocks the calling thread until every flag has been published.
    pub fn update(&self, flags: Vec<FlagConfig>) {
        let flag_keys: HashSet<String> = flags.iter().map(|flag| flag.key.clone()).collect();
        let stored_cohorts = self.cohort_storage.get_cohorts();

        let mut ready = Vec::new();
        let mut pending = Vec::new();
        for flag in flags {
            let missing: Vec<String> = flag
                .cohort_ids()
                .into_iter()
                .filter(|id| !stored_cohorts.contains_key(id))
                .collect();
            if missing.is_empty() {
                ready.push(flag);
            } else if self.cohort_loader.is_none() {
                log::warn!(target: "flagsync", flag_key = flag.key.as_str(); "flag targets cohorts but cohort sync is not configured");
                ready.push(flag);
            } else {
                pending.push((flag, missing));
            }
        }

        log::debug!(target: "flagsync", ready = ready.len(), pending = pending.len(); "publishing flag configs");
        self.flag_config_storage.put_flag_configs(ready);

        if let Some(loader) = &self.cohort_loader {
            let mut jobs: HashMap<String, Job> = HashMap::new();
            for (_, missing) in &pending {
                for cohort_id in missing {
                    jobs.entry(cohort_id.clone())
                        .or_insert_with(|| loader.load_cohort(cohort_id));
                }
            }

            for (flag, missing) in pending {
                for cohort_id in &missing {
                    if let Some(Err(err)) = jobs.get(cohort_id).map(Job::wait) {
                        log::warn!(target: "flagsync", flag_key = flag.key.as_str(), cohort_id = cohort_id.as_str(); "publishing flag without cohort: {err}");
                    }
                }
                self.flag_config_storage.put_flag_configs(vec![flag]);
            }
        }

        self.flag_config_storage
            .remove_if(&|flag| !flag_keys.contains(&flag.key));
        self.delete_unused_cohorts();
    }

    fn delete_unused_cohorts(&self) {
        let flags = self.flag_config_storage.get_flag_configs();
        let referenced = cohort_ids_for_flags(flags.values().map(|flag| &**flag));
        for cohort_id in self.cohort_storage.get_cohorts().keys() {
            if !referenced.contains(cohort_id) {
                log::debug!(target: "flagsync", cohort_id = cohort_id.as_str(); "deleting unused cohort");
                self.cohort_storage.delete_cohort(cohort_id);
            }
        }
    }

    pub fn flag_config_storage(&self) -> &Arc<dyn FlagConfigStorage> {
        &self.flag_config_storage
    }

    pub fn cohort_storage(&self) -> &Arc<dyn CohortStorage> {
        &self.cohort_storage
    }
}
