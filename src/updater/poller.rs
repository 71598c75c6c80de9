use std::{
    any::Any,
    sync::{Arc, Mutex, Weak},
    time::Duration,
};

use crate::{
    api::FlagConfigApi,
    scheduler::{Scheduler, TaskHandle},
    Result,
};

use super::{ErrorCallback, FlagConfigUpdater, FlagConfigUpdaterBase};

/// Configuration for [`FlagConfigPoller`].
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Delay between the end of one fetch and the start of the next.
    pub interval: Duration,
}

impl PollerConfig {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);
}

impl Default for PollerConfig {
    fn default() -> PollerConfig {
        PollerConfig {
            interval: PollerConfig::DEFAULT_INTERVAL,
        }
    }
}

/// Keeps flag configurations up to date by periodically fetching the full set.
pub struct FlagConfigPoller {
    inner: Arc<PollerInner>,
}

struct PollerInner {
    api: Arc<dyn FlagConfigApi>,
    base: FlagConfigUpdaterBase,
    config: PollerConfig,
    scheduler: Scheduler,
    poll_task: Mutex<Option<TaskHandle>>,
}

impl FlagConfigPoller {
    pub fn new(
        api: Arc<dyn FlagConfigApi>,
        base: FlagConfigUpdaterBase,
        config: PollerConfig,
    ) -> FlagConfigPoller {
        FlagConfigPoller {
            inner: Arc::new(PollerInner {
                api,
                base,
                config,
                scheduler: Scheduler::new("flagsync-poller"),
                poll_task: Mutex::new(None),
            }),
        }
    }
}

impl FlagConfigUpdater for FlagConfigPoller {
    fn start(&self, on_error: Option<ErrorCallback>) -> Result<()> {
        self.stop();
        self.inner.poll()?;

        let weak: Weak<PollerInner> = Arc::downgrade(&self.inner);
        let interval = self.inner.config.interval;
        let task = self
            .inner
            .scheduler
            .schedule_with_fixed_delay(interval, interval, move |handle| {
                let Some(inner) = weak.upgrade() else {
                    handle.cancel();
                    return;
                };
                let Err(err) = inner.poll() else {
                    return;
                };
                // Only the task that is still current reports, and only once.
                if inner.clear_task(handle) {
                    log::warn!(target: "flagsync", "flag config poll failed, stopping poller: {err}");
                    if let Some(on_error) = &on_error {
                        on_error(err);
                    }
                }
            })?;

        *self.inner.lock() = Some(task);
        log::debug!(target: "flagsync", interval_ms = interval.as_millis() as u64; "flag config poller started");
        Ok(())
    }

    fn stop(&self) {
        if let Some(task) = self.inner.lock().take() {
            log::debug!(target: "flagsync", "stopping flag config poller");
            task.cancel();
        }
    }

    fn shutdown(&self) {
        self.stop();
        self.inner.scheduler.shutdown();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl PollerInner {
    fn lock(&self) -> std::sync::MutexGuard<'_, Option<TaskHandle>> {
        self.poll_task
            .lock()
            .expect("poller lock should not be poisoned")
    }

    fn poll(&self) -> Result<()> {
        let flags = self.api.get_flag_configs()?;
        self.base.update(flags);
        Ok(())
    }

    /// Cancel `handle` and forget it if it is the current poll task. Returns `false` if another
    /// task has replaced it in the meantime.
    fn clear_task(&self, handle: &TaskHandle) -> bool {
        handle.cancel();
        let mut task = self.lock();
        if task.as_ref().is_some_and(|current| current.same(handle)) {
            *task = None;
            true
        } else {
            false
        }
    }
}

impl Drop for FlagConfigPoller {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{
        collections::VecDeque,
        sync::{
            atomic::{AtomicUsize, Ordering},
            mpsc, Arc, Mutex,
        },
        time::Duration,
    };

    use super::{FlagConfigPoller, PollerConfig};
    use crate::{
        api::FlagConfigApi,
        flag::{tests::flag_with_cohorts, FlagConfig},
        storage::{FlagConfigStorage, InMemoryCohortStorage, InMemoryFlagConfigStorage},
        updater::{FlagConfigUpdater, FlagConfigUpdaterBase},
        Error, Result,
    };

    /// Flag API replaying scripted responses. Once the script runs out, the last response repeats.
    pub(crate) struct FakeFlagConfigApi {
        responses: Mutex<VecDeque<Result<Vec<FlagConfig>>>>,
        last: Mutex<Result<Vec<FlagConfig>>>,
        pub(crate) calls: AtomicUsize,
    }

    impl FakeFlagConfigApi {
        pub(crate) fn new(responses: Vec<Result<Vec<FlagConfig>>>) -> Arc<FakeFlagConfigApi> {
            Arc::new(FakeFlagConfigApi {
                responses: Mutex::new(responses.into()),
                last: Mutex::new(Ok(Vec::new())),
                calls: AtomicUsize::new(0),
            })
        }

        pub(crate) fn push(&self, response: Result<Vec<FlagConfig>>) {
            self.responses.lock().unwrap().push_back(response);
        }
    }

    impl FlagConfigApi for FakeFlagConfigApi {
        fn get_flag_configs(&self) -> Result<Vec<FlagConfig>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut last = self.last.lock().unwrap();
            if let Some(response) = self.responses.lock().unwrap().pop_front() {
                *last = response;
            }
            last.clone()
        }
    }

    fn poller(
        api: Arc<FakeFlagConfigApi>,
        interval: Duration,
    ) -> (FlagConfigPoller, Arc<InMemoryFlagConfigStorage>) {
        let flags = Arc::new(InMemoryFlagConfigStorage::new());
        let base =
            FlagConfigUpdaterBase::new(flags.clone(), Arc::new(InMemoryCohortStorage::new()), None);
        (
            FlagConfigPoller::new(api, base, PollerConfig { interval }),
            flags,
        )
    }

    #[test]
    fn failed_initial_fetch_fails_start_and_schedules_nothing() {
        let api = FakeFlagConfigApi::new(vec![Err(Error::UnexpectedStatus(500))]);
        let (poller, _) = poller(api.clone(), Duration::from_millis(20));

        let result = poller.start(None);

        assert!(matches!(result, Err(Error::UnexpectedStatus(500))));
        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(api.calls.load(Ordering::SeqCst), 1);
        poller.shutdown();
    }

    #[test]
    fn initial_fetch_is_applied_before_start_returns() {
        let api = FakeFlagConfigApi::new(vec![Ok(vec![flag_with_cohorts("a", &[])])]);
        let (poller, flags) = poller(api, Duration::from_secs(60));

        poller.start(None).unwrap();

        assert!(flags.get_flag_config("a").is_some());
        poller.shutdown();
    }

    #[test]
    fn polls_periodically() {
        let api = FakeFlagConfigApi::new(vec![
            Ok(vec![flag_with_cohorts("a", &[])]),
            Ok(vec![flag_with_cohorts("b", &[])]),
        ]);
        let (poller, flags) = poller(api.clone(), Duration::from_millis(20));

        poller.start(None).unwrap();
        std::thread::sleep(Duration::from_millis(200));

        assert!(api.calls.load(Ordering::SeqCst) >= 3);
        assert!(flags.get_flag_config("a").is_none());
        assert!(flags.get_flag_config("b").is_some());
        poller.shutdown();
    }

    #[test]
    fn background_failure_stops_polling_and_reports_once() {
        let api = FakeFlagConfigApi::new(vec![Ok(vec![])]);
        let (poller, _) = poller(api.clone(), Duration::from_millis(20));
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);

        poller
            .start(Some(Arc::new(move |err| {
                let _ = tx.lock().unwrap().send(err);
            })))
            .unwrap();
        api.push(Err(Error::Unauthorized));

        assert!(matches!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            Error::Unauthorized
        ));
        let calls = api.calls.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(150));
        assert!(rx.try_recv().is_err());
        assert_eq!(api.calls.load(Ordering::SeqCst), calls);
        poller.shutdown();
    }

    #[test]
    fn restart_after_stop_fetches_again() {
        let api = FakeFlagConfigApi::new(vec![Ok(vec![])]);
        let (poller, _) = poller(api.clone(), Duration::from_secs(60));

        poller.start(None).unwrap();
        poller.stop();
        poller.stop();
        poller.start(None).unwrap();

        assert_eq!(api.calls.load(Ordering::SeqCst), 2);
        poller.shutdown();
    }
}
