use std::{
    collections::VecDeque,
    io::{self, Read},
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc, Arc, Mutex,
    },
    time::{Duration, Instant},
};

use flagsync::{
    api::{CohortApi, FlagConfigApi},
    cohort::{Cohort, CohortDownload},
    flag::FlagConfig,
    sse::EventSource,
    CohortSyncConfig, DeploymentRunner, Result, RunnerSources, StreamError, SyncConfig,
};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn flag(key: &str, cohort_ids: &[&str]) -> FlagConfig {
    serde_json::from_value(serde_json::json!({
        "key": key,
        "variants": {"on": {"key": "on"}},
        "segments": [{
            "conditions": [[{
                "selector": ["context", "user", "cohort_ids"],
                "op": "set contains any",
                "values": cohort_ids,
            }]],
            "variant": "on",
        }],
    }))
    .unwrap()
}

fn wait_until(condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(3);
    while !condition() {
        if Instant::now() > deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    true
}

struct StaticFlags {
    flags: Mutex<Vec<FlagConfig>>,
    calls: AtomicUsize,
}

impl StaticFlags {
    fn new(flags: Vec<FlagConfig>) -> Arc<StaticFlags> {
        Arc::new(StaticFlags {
            flags: Mutex::new(flags),
            calls: AtomicUsize::new(0),
        })
    }
}

impl FlagConfigApi for StaticFlags {
    fn get_flag_configs(&self) -> Result<Vec<FlagConfig>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.flags.lock().unwrap().clone())
    }
}

/// Serves every cohort with a version that increases on each download.
struct VersionedCohorts {
    downloads: AtomicUsize,
}

impl CohortApi for VersionedCohorts {
    fn get_cohort(&self, cohort_id: &str, _existing: Option<&Cohort>) -> Result<CohortDownload> {
        let version = self.downloads.fetch_add(1, Ordering::SeqCst) as i64 + 1;
        Ok(CohortDownload::Updated(Cohort {
            id: cohort_id.to_owned(),
            group_type: "User".to_owned(),
            size: 1,
            last_modified: version,
            member_ids: ["user-1".to_owned()].into_iter().collect(),
        }))
    }
}

enum Chunk {
    Bytes(Vec<u8>),
    Fail(io::ErrorKind),
}

struct StreamBody {
    receiver: mpsc::Receiver<Chunk>,
    pending: VecDeque<u8>,
}

impl Read for StreamBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            match self.receiver.recv() {
                Ok(Chunk::Bytes(bytes)) => self.pending.extend(bytes),
                Ok(Chunk::Fail(kind)) => return Err(io::Error::new(kind, "stream failure")),
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len());
        for (slot, byte) in buf.iter_mut().zip(self.pending.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

/// Event source whose connections are driven by the test through the senders it hands out.
struct ScriptedStream {
    connections: Mutex<mpsc::Sender<mpsc::Sender<Chunk>>>,
}

impl EventSource for ScriptedStream {
    fn open(&self) -> std::result::Result<Box<dyn Read + Send>, StreamError> {
        let (sender, receiver) = mpsc::channel();
        let _ = self.connections.lock().unwrap().send(sender);
        Ok(Box::new(StreamBody {
            receiver,
            pending: VecDeque::new(),
        }))
    }
}

fn send_flags(connection: &mpsc::Sender<Chunk>, flags: &[FlagConfig]) {
    let frame = format!("data: {}\n\n", serde_json::to_string(flags).unwrap());
    connection.send(Chunk::Bytes(frame.into_bytes())).unwrap();
}

#[test]
fn polling_runner_downloads_and_refreshes_cohorts() {
    init();
    let flags = StaticFlags::new(vec![flag("targeted", &["cohort-1"]), flag("plain", &[])]);
    let cohorts = Arc::new(VersionedCohorts {
        downloads: AtomicUsize::new(0),
    });
    let mut cohort_config = CohortSyncConfig::new("api-key", "secret-key");
    cohort_config.cohort_polling_interval = Duration::from_millis(50);
    let mut config = SyncConfig::from_deployment_key("deployment-key");
    config.cohort_sync_config(cohort_config);

    let runner = DeploymentRunner::with_sources(
        &config,
        RunnerSources {
            flag_config_api: flags.clone(),
            event_source: None,
            cohort_api: Some(cohorts.clone()),
        },
    );
    runner.start().unwrap();

    let flag_storage = runner.flag_config_storage();
    let cohort_storage = runner.cohort_storage();
    assert_eq!(flag_storage.get_flag_configs().len(), 2);
    assert_eq!(cohort_storage.get_cohort("cohort-1").unwrap().last_modified, 1);

    let ids = ["cohort-1".to_owned()].into_iter().collect();
    assert_eq!(cohort_storage.get_cohorts_for_user("user-1", &ids), ids);
    assert!(cohort_storage.get_cohorts_for_user("user-2", &ids).is_empty());

    assert!(wait_until(|| cohort_storage
        .get_cohort("cohort-1")
        .is_some_and(|cohort| cohort.last_modified > 1)));
    runner.stop();
}

#[test]
fn streaming_runner_falls_back_to_polling_when_stream_fails() {
    init();
    let polled = StaticFlags::new(vec![flag("polled", &[])]);
    let (connections_tx, connections) = mpsc::channel();
    let stream = Arc::new(ScriptedStream {
        connections: Mutex::new(connections_tx),
    });
    let mut config = SyncConfig::from_deployment_key("deployment-key");
    config
        .stream_updates(true)
        .stream_flag_conn_timeout(Duration::from_secs(2))
        .retry_delay(Duration::from_secs(60), Duration::ZERO)
        .flag_config_poller_interval(Duration::from_secs(60));

    let runner = DeploymentRunner::with_sources(
        &config,
        RunnerSources {
            flag_config_api: polled.clone(),
            event_source: Some(stream),
            cohort_api: None,
        },
    );

    let server = std::thread::spawn(move || {
        let connection = connections.recv_timeout(Duration::from_secs(2)).unwrap();
        send_flags(&connection, &[flag("streamed", &[])]);
        connection
    });
    runner.start().unwrap();
    let connection = server.join().unwrap();

    let flag_storage = runner.flag_config_storage();
    assert!(flag_storage.get_flag_config("streamed").is_some());
    assert_eq!(polled.calls.load(Ordering::SeqCst), 0);

    send_flags(&connection, &[flag("streamed-2", &[])]);
    assert!(wait_until(|| flag_storage.get_flag_config("streamed-2").is_some()));

    connection
        .send(Chunk::Fail(io::ErrorKind::TimedOut))
        .unwrap();
    assert!(wait_until(|| flag_storage.get_flag_config("polled").is_some()));
    assert!(flag_storage.get_flag_config("streamed-2").is_none());
    runner.stop();
}
