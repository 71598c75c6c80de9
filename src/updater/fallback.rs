use std::{
    any::Any,
    sync::{Arc, Mutex, Weak},
    time::Duration,
};

use crate::{
    scheduler::{Scheduler, TaskHandle},
    util::jittered,
    Error, Result,
};

use super::{ErrorCallback, FlagConfigUpdater};

/// Retry timing for [`FlagConfigFallbackRetryWrapper`].
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay between attempts to restart the main updater.
    pub retry_delay: Duration,
    pub retry_jitter: Duration,
    /// Delay between attempts to restart the fallback updater.
    pub fallback_retry_delay: Duration,
    pub fallback_retry_jitter: Duration,
}

impl RetryConfig {
    pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(15);
    pub const DEFAULT_RETRY_JITTER: Duration = Duration::from_secs(2);
}

impl Default for RetryConfig {
    fn default() -> RetryConfig {
        RetryConfig {
            retry_delay: RetryConfig::DEFAULT_RETRY_DELAY,
            retry_jitter: RetryConfig::DEFAULT_RETRY_JITTER,
            fallback_retry_delay: RetryConfig::DEFAULT_RETRY_DELAY,
            fallback_retry_jitter: RetryConfig::DEFAULT_RETRY_JITTER,
        }
    }
}

/// Runs a main updater, falling back to a secondary updater while the main one is down.
///
/// Once started, the wrapper keeps retrying the main updater in the background until it comes
/// back, then stops the fallback. Failures after a successful start are never surfaced to the
/// caller.
pub struct FlagConfigFallbackRetryWrapper {
    inner: Arc<WrapperInner>,
}

struct WrapperInner {
    main: Arc<dyn FlagConfigUpdater>,
    fallback: Option<Arc<dyn FlagConfigUpdater>>,
    config: RetryConfig,
    scheduler: Scheduler,
    state: Mutex<WrapperState>,
}

#[derive(Default)]
struct WrapperState {
    running: bool,
    /// Pending main restart attempt.
    main_retry: Option<TaskHandle>,
    /// Pending fallback restart attempt.
    fallback_retry: Option<TaskHandle>,
    /// Main restart attempt in progress.
    main_attempt: Option<TaskHandle>,
    /// Fallback restart attempt in progress.
    fallback_attempt: Option<TaskHandle>,
    /// Main updater failures reported so far.
    main_failures: u64,
}

impl WrapperState {
    /// Pending and in-progress attempt slots of `target`.
    fn slots(&mut self, target: Target) -> (&mut Option<TaskHandle>, &mut Option<TaskHandle>) {
        match target {
            Target::Main => (&mut self.main_retry, &mut self.main_attempt),
            Target::Fallback => (&mut self.fallback_retry, &mut self.fallback_attempt),
        }
    }

    fn main_down(&self) -> bool {
        self.main_retry.is_some() || self.main_attempt.is_some()
    }
}

#[derive(Clone, Copy)]
enum Target {
    Main,
    Fallback,
}

impl FlagConfigFallbackRetryWrapper {
    pub fn new(
        main: Arc<dyn FlagConfigUpdater>,
        fallback: Option<Arc<dyn FlagConfigUpdater>>,
        config: RetryConfig,
    ) -> FlagConfigFallbackRetryWrapper {
        FlagConfigFallbackRetryWrapper {
            inner: Arc::new(WrapperInner {
                main,
                fallback,
                config,
                scheduler: Scheduler::new("flagsync-updater-retry"),
                state: Mutex::new(WrapperState::default()),
            }),
        }
    }
}

impl FlagConfigUpdater for FlagConfigFallbackRetryWrapper {
    /// Start the main updater, or the fallback if the main one fails.
    ///
    /// # Errors
    ///
    /// - [`Error::NestedFallbackWrapper`] if the main updater is itself a wrapper.
    /// - The main updater's error if it fails and there is no fallback.
    /// - The fallback's error if both fail.
    fn start(&self, _on_error: Option<ErrorCallback>) -> Result<()> {
        let inner = &self.inner;
        if inner
            .main
            .as_any()
            .is::<FlagConfigFallbackRetryWrapper>()
        {
            return Err(Error::NestedFallbackWrapper);
        }

        // Running before the main updater starts, so a failure it reports right away is handled.
        let failures = {
            let mut state = inner.lock();
            state.running = true;
            state.main_failures
        };

        match inner.main.start(Some(inner.main_error_callback())) {
            Ok(()) => {
                inner.settle_on_main(failures);
                Ok(())
            }
            Err(err) => {
                let Some(fallback) = &inner.fallback else {
                    inner.halt();
                    return Err(err);
                };
                log::warn!(target: "flagsync", "main flag updater failed to start, starting fallback: {err}");
                if let Err(err) = fallback.start(Some(inner.fallback_error_callback())) {
                    inner.halt();
                    return Err(err);
                }

                let mut state = inner.lock();
                if state.running {
                    inner.arm(&mut state, Target::Main);
                }
                Ok(())
            }
        }
    }

    fn stop(&self) {
        let inner = &self.inner;
        inner.halt();
        inner.main.stop();
        if let Some(fallback) = &inner.fallback {
            fallback.stop();
        }
    }

    fn shutdown(&self) {
        self.stop();
        self.inner.scheduler.shutdown();
        self.inner.main.shutdown();
        if let Some(fallback) = &self.inner.fallback {
            fallback.shutdown();
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl WrapperInner {
    fn lock(&self) -> std::sync::MutexGuard<'_, WrapperState> {
        self.state
            .lock()
            .expect("fallback retry wrapper lock should not be poisoned")
    }

    /// Mark the wrapper as stopped and cancel every retry.
    fn halt(&self) {
        let tasks = {
            let mut state = self.lock();
            state.running = false;
            state.main_attempt = None;
            state.fallback_attempt = None;
            [state.main_retry.take(), state.fallback_retry.take()]
        };
        for task in tasks.into_iter().flatten() {
            task.cancel();
        }
    }

    fn main_error_callback(self: &Arc<Self>) -> ErrorCallback {
        let weak = Arc::downgrade(self);
        Arc::new(move |err| {
            if let Some(inner) = weak.upgrade() {
                inner.on_main_error(err);
            }
        })
    }

    fn fallback_error_callback(self: &Arc<Self>) -> ErrorCallback {
        let weak = Arc::downgrade(self);
        Arc::new(move |err| {
            if let Some(inner) = weak.upgrade() {
                inner.on_fallback_error(err);
            }
        })
    }

    fn on_main_error(self: &Arc<Self>, err: Error) {
        {
            let mut state = self.lock();
            if !state.running {
                return;
            }
            state.main_failures += 1;
            log::warn!(target: "flagsync", "main flag updater failed, switching to fallback: {err}");
            self.arm(&mut state, Target::Main);
        }
        self.start_fallback();
    }

    fn on_fallback_error(self: &Arc<Self>, err: Error) {
        let mut state = self.lock();
        // The fallback only needs to run while the main updater is down.
        if state.running && state.main_down() {
            log::warn!(target: "flagsync", "fallback flag updater failed: {err}");
            self.arm(&mut state, Target::Fallback);
        }
    }

    fn start_fallback(self: &Arc<Self>) {
        let Some(fallback) = &self.fallback else {
            return;
        };
        if let Err(err) = fallback.start(Some(self.fallback_error_callback())) {
            log::warn!(target: "flagsync", "fallback flag updater failed to start: {err}");
            let mut state = self.lock();
            if state.running {
                self.arm(&mut state, Target::Fallback);
            }
        }
    }

    /// The main updater is up: stop the fallback, unless the main updater failed again after
    /// `failures` failures had been seen.
    fn settle_on_main(self: &Arc<Self>, failures: u64) {
        let fallback_retry = {
            let mut state = self.lock();
            if state.main_failures != failures {
                return;
            }
            state.fallback_attempt = None;
            state.fallback_retry.take()
        };
        if let Some(task) = fallback_retry {
            task.cancel();
        }
        let Some(fallback) = &self.fallback else {
            return;
        };
        fallback.stop();

        let failed_again = {
            let state = self.lock();
            state.running && state.main_failures != failures
        };
        if failed_again {
            self.start_fallback();
        }
    }

    /// Schedule a restart attempt for `target`, unless one is already pending.
    fn arm(self: &Arc<Self>, state: &mut WrapperState, target: Target) {
        let (delay, jitter) = match target {
            Target::Main => (self.config.retry_delay, self.config.retry_jitter),
            Target::Fallback => (
                self.config.fallback_retry_delay,
                self.config.fallback_retry_jitter,
            ),
        };
        let (pending, _) = state.slots(target);
        if pending.is_some() {
            return;
        }

        let weak: Weak<WrapperInner> = Arc::downgrade(self);
        let scheduled = self.scheduler.schedule(jittered(delay, jitter), move |handle| {
            if let Some(inner) = weak.upgrade() {
                inner.retry(target, handle);
            }
        });
        match scheduled {
            Ok(task) => *pending = Some(task),
            Err(err) => {
                log::debug!(target: "flagsync", "not scheduling flag updater retry: {err}");
            }
        }
    }

    fn retry(self: &Arc<Self>, target: Target, handle: &TaskHandle) {
        let (updater, on_error) = match (target, &self.fallback) {
            (Target::Main, _) => (&self.main, self.main_error_callback()),
            (Target::Fallback, Some(fallback)) => (fallback, self.fallback_error_callback()),
            (Target::Fallback, None) => return,
        };

        // The pending slot is freed for the duration of the attempt, so that a failure reported
        // meanwhile arms the next attempt.
        let failures = {
            let mut state = self.lock();
            let (pending, attempt) = state.slots(target);
            if !pending.as_ref().is_some_and(|current| current.same(handle)) {
                return;
            }
            *attempt = pending.take();
            state.main_failures
        };

        let result = updater.start(Some(on_error));

        let mut state = self.lock();
        let (_, attempt) = state.slots(target);
        if !attempt.as_ref().is_some_and(|current| current.same(handle)) {
            // Stopped, or the main updater recovered, while the attempt was in flight.
            let still_needed =
                state.running && matches!(target, Target::Fallback) && state.main_down();
            drop(state);
            if result.is_ok() && !still_needed {
                updater.stop();
            }
            return;
        }
        *attempt = None;

        match (target, result) {
            (Target::Main, Ok(())) => {
                drop(state);
                log::info!(target: "flagsync", "main flag updater recovered");
                self.settle_on_main(failures);
            }
            (Target::Fallback, Ok(())) => {}
            (target, Err(err)) => {
                log::debug!(target: "flagsync", "flag updater retry failed: {err}");
                self.arm(&mut state, target);
            }
        }
    }
}

impl Drop for FlagConfigFallbackRetryWrapper {
    fn drop(&mut self) {
        self.inner.halt();
    }
}
