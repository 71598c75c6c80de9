//! Single-flight cohort downloads on a bounded worker pool.
use std::{
    collections::HashMap,
    panic::AssertUnwindSafe,
    sync::{mpsc, Arc, Condvar, Mutex},
    thread::JoinHandle,
    time::Duration,
};

use crate::{
    api::CohortApi,
    backoff::{backoff, BackoffConfig, BackoffError, CancellationToken},
    cohort::CohortDownload,
    storage::CohortStorage,
    Error, Result,
};

/// An in-flight (or finished) cohort load. Clones observe the same load.
#[derive(Clone)]
pub struct Job {
    cohort_id: Arc<str>,
    /// Holds `None` while the load is running and `Some(result)` once it finished.
    result: Arc<(Mutex<Option<Result<()>>>, Condvar)>,
}

impl Job {
    fn new(cohort_id: &str) -> Job {
        Job {
            cohort_id: cohort_id.into(),
            result: Arc::new((Mutex::new(None), Condvar::new())),
        }
    }

    pub fn cohort_id(&self) -> &str {
        &self.cohort_id
    }

    /// Returns `true` if both values refer to the same load.
    pub fn same(&self, other: &Job) -> bool {
        Arc::ptr_eq(&self.result, &other.result)
    }

    pub fn is_done(&self) -> bool {
        self.result
            .0
            .lock()
            .map(|result| result.is_some())
            .unwrap_or(true)
    }

    /// Block until the load completes.
    ///
    /// # Errors
    ///
    /// Returns the error the load failed with. "Not modified" and "too large" outcomes are not
    /// errors.
    pub fn wait(&self) -> Result<()> {
        let mut lock = self.result.0.lock().map_err(|_| Error::WorkerPanicked)?;
        loop {
            match &*lock {
                Some(result) => return result.clone(),
                None => {
                    lock = self
                        .result
                        .1
                        .wait(lock)
                        .map_err(|_| Error::WorkerPanicked)?;
                }
            }
        }
    }

    /// Block until the load completes or `timeout` elapses. Returns `None` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<()>> {
        let lock = self.result.0.lock().ok()?;
        let (lock, _) = self
            .result
            .1
            .wait_timeout_while(lock, timeout, |result| result.is_none())
            .ok()?;
        lock.clone()
    }

    fn complete(&self, value: Result<()>) {
        if let Ok(mut result) = self.result.0.lock() {
            *result = Some(value);
        }
        self.result.1.notify_all();
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("cohort_id", &self.cohort_id)
            .field("done", &self.is_done())
            .finish()
    }
}

type Work = Box<dyn FnOnce() + Send>;

/// Fixed number of worker threads consuming an unbounded queue. Threads are started on first use.
pub struct WorkerPool {
    name: String,
    size: usize,
    state: Mutex<PoolState>,
}

#[derive(Default)]
struct PoolState {
    sender: Option<mpsc::Sender<Work>>,
    workers: Vec<JoinHandle<()>>,
    shutdown: bool,
}

impl WorkerPool {
    pub fn new(name: impl Into<String>, size: usize) -> WorkerPool {
        WorkerPool {
            name: name.into(),
            size: size.max(1),
            state: Mutex::new(PoolState::default()),
        }
    }

    /// Queue `work` for execution on one of the workers.
    ///
    /// # Errors
    ///
    /// - [`Error::Shutdown`] if the pool has been shut down.
    /// - [`Error::Io`] if worker threads failed to start.
    pub fn execute(&self, work: impl FnOnce() + Send + 'static) -> Result<()> {
        let mut state = self.state.lock().map_err(|_| Error::WorkerPanicked)?;
        if state.shutdown {
            return Err(Error::Shutdown);
        }
        if state.sender.is_none() {
            let (sender, receiver) = mpsc::channel::<Work>();
            let receiver = Arc::new(Mutex::new(receiver));
            for index in 0..self.size {
                let receiver = Arc::clone(&receiver);
                let worker = std::thread::Builder::new()
                    .name(format!("{}-{}", self.name, index))
                    .spawn(move || worker_loop(&receiver))?;
                state.workers.push(worker);
            }
            state.sender = Some(sender);
        }

        state
            .sender
            .as_ref()
            .ok_or(Error::Shutdown)?
            .send(Box::new(work))
            .map_err(|_| Error::Shutdown)
    }

    /// Stop accepting work. Already queued work still runs; workers exit once the queue is
    /// drained.
    pub fn shutdown(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.shutdown = true;
            // Dropping the sender disconnects the channel once the queue drains.
            state.sender = None;
            state.workers.clear();
        }
    }
}

fn worker_loop(receiver: &Mutex<mpsc::Receiver<Work>>) {
    loop {
        // The lock is only held while waiting for the next item, not while running it.
        let work = match receiver.lock() {
            Ok(receiver) => receiver.recv(),
            Err(_) => return,
        };
        let Ok(work) = work else {
            return;
        };
        if std::panic::catch_unwind(AssertUnwindSafe(work)).is_err() {
            log::error!(target: "flagsync", "cohort worker task panicked");
        }
    }
}

/// Configuration for [`CohortLoader`].
#[derive(Debug, Clone)]
pub struct CohortLoaderConfig {
    /// Number of concurrent downloads.
    pub worker_threads: usize,
    /// Retry policy for transient download failures.
    pub backoff: BackoffConfig,
}

impl Default for CohortLoaderConfig {
    fn default() -> CohortLoaderConfig {
        CohortLoaderConfig {
            worker_threads: CohortLoaderConfig::DEFAULT_WORKER_THREADS,
            backoff: BackoffConfig::default(),
        }
    }
}

impl CohortLoaderConfig {
    pub const DEFAULT_WORKER_THREADS: usize = 4;
}

/// Downloads cohorts into a [`CohortStorage`], at most one download per cohort id at a time.
pub struct CohortLoader {
    inner: Arc<LoaderInner>,
    pool: WorkerPool,
}

struct LoaderInner {
    api: Arc<dyn CohortApi>,
    storage: Arc<dyn CohortStorage>,
    backoff: BackoffConfig,
    jobs: Mutex<HashMap<String, Job>>,
    cancel: CancellationToken,
}

impl CohortLoader {
    pub fn new(
        api: Arc<dyn CohortApi>,
        storage: Arc<dyn CohortStorage>,
        config: CohortLoaderConfig,
    ) -> CohortLoader {
        CohortLoader {
            inner: Arc::new(LoaderInner {
                api,
                storage,
                backoff: config.backoff,
                jobs: Mutex::new(HashMap::new()),
                cancel: CancellationToken::new(),
            }),
            pool: WorkerPool::new("flagsync-cohort", config.worker_threads),
        }
    }

    /// Start loading `cohort_id`, or join the load that is already in flight for it.
    pub fn load_cohort(&self, cohort_id: &str) -> Job {
        let job = {
            let mut jobs = self.inner.lock_jobs();
            if let Some(job) = jobs.get(cohort_id) {
                return job.clone();
            }
            let job = Job::new(cohort_id);
            jobs.insert(cohort_id.to_owned(), job.clone());
            job
        };

        let submitted = {
            let inner = Arc::clone(&self.inner);
            let job = job.clone();
            self.pool.execute(move || {
                let result = inner.download(job.cohort_id());
                inner.finish(&job, result);
            })
        };
        if let Err(err) = submitted {
            log::warn!(target: "flagsync", cohort_id; "failed to submit cohort load: {err}");
            self.inner.finish(&job, Err(err));
        }

        job
    }

    /// Number of loads currently in flight.
    pub fn in_flight(&self) -> usize {
        self.inner.lock_jobs().len()
    }

    /// Abandon pending retries and stop the worker pool.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.pool.shutdown();
    }
}

impl LoaderInner {
    fn lock_jobs(&self) -> std::sync::MutexGuard<'_, HashMap<String, Job>> {
        self.jobs.lock().expect("cohort job table lock should not be poisoned")
    }

    fn download(&self, cohort_id: &str) -> Result<()> {
        let existing = self.storage.get_cohort(cohort_id);
        log::debug!(target: "flagsync", cohort_id; "loading cohort");

        let result = backoff(&self.backoff, &self.cancel, || {
            self.api.get_cohort(cohort_id, existing.as_deref())
        });

        match result {
            Ok(CohortDownload::Updated(cohort)) => {
                let newer = self
                    .storage
                    .get_cohort(cohort_id)
                    .map_or(true, |current| current.is_superseded_by(&cohort));
                if newer {
                    log::debug!(target: "flagsync", cohort_id, size = cohort.size, last_modified = cohort.last_modified; "storing cohort");
                    self.storage.put_cohort(cohort);
                }
                Ok(())
            }
            Ok(CohortDownload::NotModified) => {
                log::debug!(target: "flagsync", cohort_id; "cohort not modified");
                Ok(())
            }
            Ok(CohortDownload::TooLarge) => {
                log::warn!(target: "flagsync", cohort_id; "cohort exceeds the maximum cohort size, skipping");
                Ok(())
            }
            Err(BackoffError::Cancelled) => Err(Error::Cancelled),
            Err(BackoffError::Failed(err)) => {
                log::warn!(target: "flagsync", cohort_id; "failed to load cohort: {err}");
                Err(err)
            }
        }
    }

    fn finish(&self, job: &Job, result: Result<()>) {
        {
            let mut jobs = self.lock_jobs();
            if jobs.get(job.cohort_id()).is_some_and(|current| current.same(job)) {
                jobs.remove(job.cohort_id());
            }
        }
        job.complete(result);
    }
}
