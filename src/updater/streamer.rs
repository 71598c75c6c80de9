use std::{
    any::Any,
    panic::AssertUnwindSafe,
    sync::{mpsc, Arc, Mutex, Weak},
    time::Duration,
};

use crate::{
    flag::FlagConfig,
    sse::{EventSource, SseConfig, SseTransport},
    Error, Result, StreamError,
};

use super::{ErrorCallback, FlagConfigUpdater, FlagConfigUpdaterBase};

/// Callback applying a complete set of flag configurations received from the stream.
pub type FlagConfigsCallback = Arc<dyn Fn(Vec<FlagConfig>) -> Result<()> + Send + Sync>;

/// Progress of the first frame of a connection, reported back to [`FlagConfigStreamApi::connect`].
enum Startup {
    Received,
    Done(Result<()>),
}

type StartupSlot = Arc<Mutex<Option<mpsc::Sender<Startup>>>>;

/// Flag configurations over the SSE transport.
///
/// A connection only counts as established once its first data frame arrived within the
/// connection timeout and was applied successfully.
pub struct FlagConfigStreamApi {
    inner: Arc<StreamApiInner>,
}

struct StreamApiInner {
    transport: SseTransport,
    conn_timeout: Duration,
}

impl FlagConfigStreamApi {
    pub const DEFAULT_CONN_TIMEOUT: Duration = Duration::from_millis(1500);

    pub fn new(
        source: Arc<dyn EventSource>,
        sse_config: SseConfig,
        conn_timeout: Duration,
    ) -> FlagConfigStreamApi {
        FlagConfigStreamApi {
            inner: Arc::new(StreamApiInner {
                transport: SseTransport::new(source, sse_config),
                conn_timeout,
            }),
        }
    }

    /// Connect and block until the first data frame has been applied with `on_update`.
    ///
    /// Later frames are applied on a background thread; their apply failures are logged and
    /// otherwise ignored. A later frame that cannot be parsed closes the connection and is reported
    /// through `on_error`, as is any transport failure.
    ///
    /// # Errors
    ///
    /// The connection is closed on any error.
    /// - [`Error::ConnTimeout`] if no data frame arrived within the connection timeout.
    /// - [`Error::DataCorrupt`] if the first frame could not be parsed.
    /// - [`Error::Stream`] if the transport failed, or if `on_update` rejected the first frame
    ///   ([`StreamError::Update`]).
    pub fn connect(&self, on_update: FlagConfigsCallback, on_error: ErrorCallback) -> Result<()> {
        let (sender, receiver) = mpsc::channel();
        let startup: StartupSlot = Arc::new(Mutex::new(Some(sender)));

        let on_data = {
            let weak = Arc::downgrade(&self.inner);
            let startup = Arc::clone(&startup);
            let on_error = Arc::clone(&on_error);
            Arc::new(move |data: String| {
                handle_frame(&weak, &startup, &on_update, &on_error, &data);
            })
        };
        let on_stream_error = {
            let startup = Arc::clone(&startup);
            Arc::new(move |err: StreamError| {
                let pending = take_startup(&startup);
                match pending {
                    Some(sender) => {
                        let _ = sender.send(Startup::Done(Err(Error::Stream(err))));
                    }
                    None => on_error(Error::Stream(err)),
                }
            })
        };

        self.inner.transport.connect(on_data, on_stream_error)?;

        let result = await_startup(&receiver, &startup, self.inner.conn_timeout).unwrap_or_else(|| {
            log::warn!(target: "flagsync", timeout_ms = self.inner.conn_timeout.as_millis() as u64; "timed out waiting for the first flag stream frame");
            Err(Error::ConnTimeout)
        });

        if result.is_err() {
            self.inner.transport.cancel();
        }
        result
    }

    /// Close the current connection. Idempotent.
    pub fn close(&self) {
        self.inner.transport.cancel();
    }

    pub fn is_connected(&self) -> bool {
        self.inner.transport.is_connected()
    }

    pub fn shutdown(&self) {
        self.inner.transport.shutdown();
    }
}

/// Wait for the outcome of the first frame. Returns `None` if no frame was picked up within
/// `timeout`; a frame picked up right at the deadline is waited for.
fn await_startup(
    receiver: &mpsc::Receiver<Startup>,
    startup: &StartupSlot,
    timeout: Duration,
) -> Option<Result<()>> {
    match receiver.recv_timeout(timeout) {
        Ok(Startup::Done(result)) => Some(result),
        Ok(Startup::Received) => Some(wait_for_done(receiver)),
        // The frame handler already owns the sender.
        Err(_) if take_startup(startup).is_none() => Some(wait_for_done(receiver)),
        Err(_) => None,
    }
}

fn wait_for_done(receiver: &mpsc::Receiver<Startup>) -> Result<()> {
    loop {
        match receiver.recv() {
            Ok(Startup::Received) => continue,
            Ok(Startup::Done(result)) => return result,
            Err(_) => return Err(Error::Cancelled),
        }
    }
}

fn take_startup(startup: &StartupSlot) -> Option<mpsc::Sender<Startup>> {
    startup.lock().ok().and_then(|mut slot| slot.take())
}

fn handle_frame(
    inner: &Weak<StreamApiInner>,
    startup: &StartupSlot,
    on_update: &FlagConfigsCallback,
    on_error: &ErrorCallback,
    data: &str,
) {
    let parsed = serde_json::from_str::<Vec<FlagConfig>>(data)
        .map_err(|err| Error::DataCorrupt(Arc::new(err)));

    match (take_startup(startup), parsed) {
        (Some(sender), Err(err)) => {
            let _ = sender.send(Startup::Done(Err(err)));
        }
        (Some(sender), Ok(flags)) => {
            let _ = sender.send(Startup::Received);
            let result = on_update(flags)
                .map_err(|err| Error::Stream(StreamError::Update(Arc::new(err))));
            let _ = sender.send(Startup::Done(result));
        }
        (None, Err(err)) => {
            log::warn!(target: "flagsync", "received corrupt flag stream frame, closing connection: {err}");
            if let Some(inner) = inner.upgrade() {
                inner.transport.cancel();
            }
            on_error(err);
        }
        (None, Ok(flags)) => {
            log::debug!(target: "flagsync", count = flags.len(); "received flag configs from stream");
            if let Err(err) = on_update(flags) {
                log::warn!(target: "flagsync", "failed to apply streamed flag configs: {err}");
            }
        }
    }
}

/// Keeps flag configurations up to date with snapshots pushed over the flag stream.
pub struct FlagConfigStreamer {
    api: FlagConfigStreamApi,
    base: FlagConfigUpdaterBase,
}

impl FlagConfigStreamer {
    pub fn new(api: FlagConfigStreamApi, base: FlagConfigUpdaterBase) -> FlagConfigStreamer {
        FlagConfigStreamer { api, base }
    }
}

impl FlagConfigUpdater for FlagConfigStreamer {
    fn start(&self, on_error: Option<ErrorCallback>) -> Result<()> {
        self.stop();

        let on_update: FlagConfigsCallback = {
            let base = self.base.clone();
            Arc::new(move |flags| {
                std::panic::catch_unwind(AssertUnwindSafe(|| base.update(flags)))
                    .map_err(|_| Error::WorkerPanicked)
            })
        };
        let on_stream_error: ErrorCallback = Arc::new(move |err| {
            log::warn!(target: "flagsync", "flag streamer stopped: {err}");
            if let Some(on_error) = &on_error {
                on_error(err);
            }
        });

        self.api.connect(on_update, on_stream_error)?;
        log::debug!(target: "flagsync", "flag streamer started");
        Ok(())
    }

    fn stop(&self) {
        self.api.close();
    }

    fn shutdown(&self) {
        self.api.shutdown();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io,
        sync::{mpsc, Arc, Mutex},
        time::Duration,
    };

    use super::{
        await_startup, FlagConfigStreamApi, FlagConfigStreamer, FlagConfigsCallback, Startup,
        StartupSlot,
    };
    use crate::{
        sse::{
            tests::{FakeEventSource, WAIT},
            SseConfig,
        },
        storage::{FlagConfigStorage, InMemoryCohortStorage, InMemoryFlagConfigStorage},
        updater::{ErrorCallback, FlagConfigUpdater, FlagConfigUpdaterBase},
        Error, StreamError,
    };

    const FLAGS: &str = r#"[{"key":"a","variants":{},"segments":[]}]"#;

    fn sse_config() -> SseConfig {
        SseConfig {
            keepalive_timeout: Duration::from_secs(60),
            reconnect_interval: Duration::from_secs(3600),
            reconnect_jitter: Duration::ZERO,
        }
    }

    fn recording_errors() -> (ErrorCallback, mpsc::Receiver<Error>) {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let callback: ErrorCallback = Arc::new(move |err| {
            let _ = tx.lock().unwrap().send(err);
        });
        (callback, rx)
    }

    fn accept_all() -> FlagConfigsCallback {
        Arc::new(|_| Ok(()))
    }

    #[test]
    fn first_frame_apply_failure_fails_connect_and_closes_transport() {
        let (source, connections) = FakeEventSource::new();
        let api = FlagConfigStreamApi::new(source, sse_config(), WAIT);
        let (on_error, errors) = recording_errors();

        let server = std::thread::spawn(move || {
            let server = connections.recv_timeout(WAIT).unwrap();
            server.send_keepalive();
            server.send_data(FLAGS);
            server
        });
        let result = api.connect(Arc::new(|_| Err(Error::Unauthorized)), on_error);
        let _server = server.join().unwrap();

        assert!(matches!(
            result,
            Err(Error::Stream(StreamError::Update(ref cause))) if matches!(**cause, Error::Unauthorized)
        ));
        assert!(!api.is_connected());
        assert!(errors.try_recv().is_err());
        api.shutdown();
    }

    #[test]
    fn missing_first_frame_times_out() {
        let (source, connections) = FakeEventSource::new();
        let api = FlagConfigStreamApi::new(source, sse_config(), Duration::from_millis(50));
        let (on_error, _errors) = recording_errors();

        let result = api.connect(accept_all(), on_error);
        let _server = connections.recv_timeout(WAIT).unwrap();

        assert!(matches!(result, Err(Error::ConnTimeout)));
        assert!(!api.is_connected());
        api.shutdown();
    }

    #[test]
    fn frame_picked_up_at_the_deadline_is_waited_for() {
        let (sender, receiver) = mpsc::channel();
        let startup: StartupSlot = Arc::new(Mutex::new(Some(sender)));

        // Nothing picked up the first frame.
        assert!(await_startup(&receiver, &startup, Duration::from_millis(20)).is_none());

        let (sender, receiver) = mpsc::channel();
        let startup: StartupSlot = Arc::new(Mutex::new(Some(sender)));
        let handler = startup.lock().unwrap().take().unwrap();
        let frame = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            handler.send(Startup::Received).unwrap();
            handler.send(Startup::Done(Ok(()))).unwrap();
        });

        let result = await_startup(&receiver, &startup, Duration::from_millis(20));
        frame.join().unwrap();
        assert!(matches!(result, Some(Ok(()))));
    }

    #[test]
    fn corrupt_first_frame_fails_connect() {
        let (source, connections) = FakeEventSource::new();
        let api = FlagConfigStreamApi::new(source, sse_config(), WAIT);
        let (on_error, _errors) = recording_errors();

        let server = std::thread::spawn(move || {
            let server = connections.recv_timeout(WAIT).unwrap();
            server.send_data("{not json");
            server
        });
        let result = api.connect(accept_all(), on_error);
        let _server = server.join().unwrap();

        assert!(matches!(result, Err(Error::DataCorrupt(_))));
        assert!(!api.is_connected());
        api.shutdown();
    }

    #[test]
    fn transport_failure_before_first_frame_fails_connect() {
        let (source, _connections) = FakeEventSource::new();
        source.fail_next_open(StreamError::Status(503));
        let api = FlagConfigStreamApi::new(source, sse_config(), WAIT);
        let (on_error, errors) = recording_errors();

        let result = api.connect(accept_all(), on_error);

        assert!(matches!(result, Err(Error::Stream(StreamError::Status(503)))));
        assert!(errors.try_recv().is_err());
        api.shutdown();
    }

    fn streamer(
        source: Arc<FakeEventSource>,
    ) -> (FlagConfigStreamer, Arc<InMemoryFlagConfigStorage>) {
        let flags = Arc::new(InMemoryFlagConfigStorage::new());
        let base =
            FlagConfigUpdaterBase::new(flags.clone(), Arc::new(InMemoryCohortStorage::new()), None);
        let api = FlagConfigStreamApi::new(source, sse_config(), WAIT);
        (FlagConfigStreamer::new(api, base), flags)
    }

    #[test]
    fn streamer_applies_first_and_later_frames() {
        let (source, connections) = FakeEventSource::new();
        let (streamer, flags) = streamer(source);

        let server = std::thread::spawn(move || {
            let server = connections.recv_timeout(WAIT).unwrap();
            server.send_data(FLAGS);
            server
        });
        streamer.start(None).unwrap();
        let server = server.join().unwrap();
        assert!(flags.get_flag_config("a").is_some());

        server.send_data(r#"[{"key":"b","variants":{},"segments":[]}]"#);
        let deadline = std::time::Instant::now() + WAIT;
        while flags.get_flag_config("b").is_none() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(flags.get_flag_config("b").is_some());
        assert!(flags.get_flag_config("a").is_none());
        streamer.shutdown();
    }

    #[test]
    fn corrupt_later_frame_closes_connection_and_reports() {
        let (source, connections) = FakeEventSource::new();
        let (streamer, flags) = streamer(source);
        let (on_error, errors) = recording_errors();

        let server = std::thread::spawn(move || {
            let server = connections.recv_timeout(WAIT).unwrap();
            server.send_data(FLAGS);
            server
        });
        streamer.start(Some(on_error)).unwrap();
        let server = server.join().unwrap();

        server.send_data("garbage");
        assert!(matches!(errors.recv_timeout(WAIT).unwrap(), Error::DataCorrupt(_)));
        assert!(!streamer.api.is_connected());
        // Last known-good flags stay in place.
        assert!(flags.get_flag_config("a").is_some());

        server.fail(io::ErrorKind::ConnectionReset);
        std::thread::sleep(Duration::from_millis(100));
        assert!(errors.try_recv().is_err());
        streamer.shutdown();
    }

    #[test]
    fn transport_failure_after_start_is_reported_once() {
        let (source, connections) = FakeEventSource::new();
        let (streamer, _flags) = streamer(source);
        let (on_error, errors) = recording_errors();

        let server = std::thread::spawn(move || {
            let server = connections.recv_timeout(WAIT).unwrap();
            server.send_data(FLAGS);
            server
        });
        streamer.start(Some(on_error)).unwrap();
        let server = server.join().unwrap();

        server.fail(io::ErrorKind::TimedOut);
        assert!(matches!(
            errors.recv_timeout(WAIT).unwrap(),
            Error::Stream(StreamError::Timeout)
        ));
        std::thread::sleep(Duration::from_millis(100));
        assert!(errors.try_recv().is_err());
        streamer.shutdown();
    }
}
