//! Server-sent events transport for the flag stream.
//!
//! [`SseTransport`] owns at most one live connection. It forwards data frames to a callback,
//! drops keepalive frames, reconnects silently when the server closes the connection, and
//! periodically forces a fresh connection so that a connection that silently went stale cannot
//! live forever. Any other failure is reported to the caller, who decides whether to reconnect.
use std::{
    io::{BufRead, BufReader, Read},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, Weak,
    },
    time::Duration,
};

use reqwest::{header, StatusCode, Url};

use crate::{
    api::{endpoint_url, USER_AGENT},
    scheduler::{Scheduler, TaskHandle},
    util::jittered,
    Result, StreamError,
};

/// Payload of the frames the server sends to prove the connection is alive.
pub const KEEPALIVE_DATA: &str = " ";

/// Opens stream connections.
pub trait EventSource: Send + Sync {
    /// Open a new connection and return its body.
    fn open(&self) -> std::result::Result<Box<dyn Read + Send>, StreamError>;
}

/// [`EventSource`] requesting `GET {stream_server_url}/sdk/stream/v1/flags`.
pub struct HttpEventSource {
    client: reqwest::blocking::Client,
    url: Url,
    authorization: String,
}

impl HttpEventSource {
    /// `keepalive_timeout` bounds the connection setup and every single read from the stream; the
    /// server sends keepalive frames well within it.
    pub fn new(
        stream_server_url: &str,
        deployment_key: &str,
        keepalive_timeout: Duration,
    ) -> Result<HttpEventSource> {
        let url = endpoint_url(stream_server_url, &["sdk", "stream", "v1", "flags"])?;
        let client = reqwest::blocking::Client::builder()
            .timeout(keepalive_timeout)
            .user_agent(USER_AGENT)
            .build()?;

        Ok(HttpEventSource {
            client,
            url,
            authorization: format!("Api-Key {deployment_key}"),
        })
    }
}

impl EventSource for HttpEventSource {
    fn open(&self) -> std::result::Result<Box<dyn Read + Send>, StreamError> {
        let response = self
            .client
            .get(self.url.clone())
            .header(header::AUTHORIZATION, &self.authorization)
            .header(header::ACCEPT, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache")
            .send()
            .map_err(|err| {
                if err.is_timeout() {
                    StreamError::Timeout
                } else {
                    StreamError::Connect(Arc::new(err.without_url()))
                }
            })?;

        match response.status() {
            StatusCode::OK => Ok(Box::new(response)),
            status => Err(StreamError::Status(status.as_u16())),
        }
    }
}

/// Incremental parser for the `text/event-stream` format. Only `data` fields are kept.
#[derive(Debug, Default)]
pub struct FrameParser {
    data: String,
    has_data: bool,
}

impl FrameParser {
    /// Feed one line (with or without its line terminator). Returns the frame's data when the line
    /// completes a frame.
    pub fn push_line(&mut self, line: &str) -> Option<String> {
        let line = line.strip_suffix('\n').unwrap_or(line);
        let line = line.strip_suffix('\r').unwrap_or(line);

        if line.is_empty() {
            if !self.has_data {
                return None;
            }
            self.has_data = false;
            return Some(std::mem::take(&mut self.data));
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        if field == "data" {
            if self.has_data {
                self.data.push('\n');
            }
            self.data.push_str(value);
            self.has_data = true;
        }
        None
    }
}

/// Callback receiving the payload of every non-keepalive frame.
pub type DataCallback = Arc<dyn Fn(String) + Send + Sync>;

/// Callback receiving a transport failure. The transport does not reconnect after it fires.
pub type StreamErrorCallback = Arc<dyn Fn(StreamError) + Send + Sync>;

/// Configuration for [`SseTransport`].
#[derive(Debug, Clone)]
pub struct SseConfig {
    /// Longest silence tolerated on a connection. Applied by the [`EventSource`] as a read
    /// deadline.
    pub keepalive_timeout: Duration,
    /// Interval after which a connection is replaced by a fresh one.
    pub reconnect_interval: Duration,
    /// Random perturbation applied to `reconnect_interval`.
    pub reconnect_jitter: Duration,
}

impl SseConfig {
    pub const DEFAULT_KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(17);
    pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(15 * 60);
    pub const DEFAULT_RECONNECT_JITTER: Duration = Duration::from_secs(60);
}

impl Default for SseConfig {
    fn default() -> SseConfig {
        SseConfig {
            keepalive_timeout: SseConfig::DEFAULT_KEEPALIVE_TIMEOUT,
            reconnect_interval: SseConfig::DEFAULT_RECONNECT_INTERVAL,
            reconnect_jitter: SseConfig::DEFAULT_RECONNECT_JITTER,
        }
    }
}

/// Manages the lifecycle of a single stream connection.
pub struct SseTransport {
    inner: Arc<TransportInner>,
}

struct TransportInner {
    source: Arc<dyn EventSource>,
    config: SseConfig,
    scheduler: Scheduler,
    state: Mutex<TransportState>,
}

#[derive(Default)]
struct TransportState {
    connection: Option<Arc<Connection>>,
    reconnect_task: Option<TaskHandle>,
    callbacks: Option<Callbacks>,
    next_id: u64,
}

/// Identity of one physical connection. Superseded connections are marked closed, which turns
/// their remaining callbacks into no-ops.
#[derive(Debug)]
struct Connection {
    id: u64,
    closed: AtomicBool,
}

impl Connection {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Clone)]
struct Callbacks {
    on_data: DataCallback,
    on_error: StreamErrorCallback,
}

impl SseTransport {
    pub fn new(source: Arc<dyn EventSource>, config: SseConfig) -> SseTransport {
        SseTransport {
            inner: Arc::new(TransportInner {
                source,
                config,
                scheduler: Scheduler::new("flagsync-stream-reconnect"),
                state: Mutex::new(TransportState::default()),
            }),
        }
    }

    /// Open a connection in the background, replacing the current one (if any).
    ///
    /// Returns immediately. Data frames are delivered to `on_data`; a failure other than the
    /// server closing the connection is delivered to `on_error` once, after which the transport
    /// stays disconnected.
    ///
    /// # Errors
    ///
    /// - [`Error::Shutdown`](crate::Error::Shutdown) if the transport has been shut down.
    pub fn connect(&self, on_data: DataCallback, on_error: StreamErrorCallback) -> Result<()> {
        let connection = {
            let mut state = self.inner.lock();
            state.teardown();
            state.callbacks = Some(Callbacks { on_data, on_error });
            self.inner.open_connection(&mut state)?
        };
        TransportInner::spawn_reader(&self.inner, connection);
        Ok(())
    }

    /// Close the current connection and cancel the reconnect timer. Idempotent.
    pub fn cancel(&self) {
        self.inner.lock().teardown();
    }

    /// Returns `true` while a connection is open or being opened.
    pub fn is_connected(&self) -> bool {
        self.inner.lock().connection.is_some()
    }

    /// Cancel and release the reconnect timer thread. The transport cannot be used afterwards.
    pub fn shutdown(&self) {
        self.cancel();
        self.inner.scheduler.shutdown();
    }
}

impl TransportState {
    fn teardown(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.close();
        }
        if let Some(task) = self.reconnect_task.take() {
            task.cancel();
        }
        self.callbacks = None;
    }
}

impl TransportInner {
    fn lock(&self) -> std::sync::MutexGuard<'_, TransportState> {
        self.state.lock().expect("stream transport lock should not be poisoned")
    }

    /// Register a new current connection and arm the forced-reconnect timer for it.
    fn open_connection(self: &Arc<Self>, state: &mut TransportState) -> Result<Arc<Connection>> {
        let connection = Arc::new(Connection {
            id: state.next_id,
            closed: AtomicBool::new(false),
        });
        state.next_id += 1;

        let delay = jittered(self.config.reconnect_interval, self.config.reconnect_jitter);
        let weak: Weak<TransportInner> = Arc::downgrade(self);
        let expected = Arc::clone(&connection);
        let task = self.scheduler.schedule(delay, move |_| {
            if let Some(inner) = weak.upgrade() {
                log::debug!(target: "flagsync", connection = expected.id; "forcing periodic stream reconnect");
                inner.reconnect(&expected);
            }
        })?;

        state.connection = Some(Arc::clone(&connection));
        state.reconnect_task = Some(task);
        Ok(connection)
    }

    /// Replace `expected` with a fresh connection. No-op if `expected` is no longer current.
    fn reconnect(self: &Arc<Self>, expected: &Arc<Connection>) {
        let connection = {
            let mut state = self.lock();
            if !state.is_current(expected) {
                return;
            }
            expected.close();
            if let Some(task) = state.reconnect_task.take() {
                task.cancel();
            }
            match self.open_connection(&mut state) {
                Ok(connection) => connection,
                Err(err) => {
                    log::debug!(target: "flagsync", "not reconnecting stream: {err}");
                    state.connection = None;
                    return;
                }
            }
        };
        Self::spawn_reader(self, connection);
    }

    /// Report `err` for `connection` unless it has been superseded or cancelled.
    fn fail(&self, connection: &Arc<Connection>, err: StreamError) {
        let callbacks = {
            let mut state = self.lock();
            if !state.is_current(connection) {
                return;
            }
            connection.close();
            state.connection = None;
            if let Some(task) = state.reconnect_task.take() {
                task.cancel();
            }
            state.callbacks.clone()
        };
        log::warn!(target: "flagsync", connection = connection.id; "flag stream failed: {err}");
        if let Some(callbacks) = callbacks {
            (callbacks.on_error)(err);
        }
    }

    fn spawn_reader(self: &Arc<Self>, connection: Arc<Connection>) {
        let inner = Arc::clone(self);
        let reader_connection = Arc::clone(&connection);
        let spawned = std::thread::Builder::new()
            .name(format!("flagsync-stream-{}", connection.id))
            .spawn(move || inner.read_connection(&reader_connection));
        if let Err(err) = spawned {
            self.fail(&connection, StreamError::Reset(Arc::new(err)));
        }
    }

    fn read_connection(self: &Arc<Self>, connection: &Arc<Connection>) {
        log::debug!(target: "flagsync", connection = connection.id; "opening flag stream");
        let body = match self.source.open() {
            Ok(body) => body,
            Err(err) => {
                self.fail(connection, err);
                return;
            }
        };

        let mut reader = BufReader::new(body);
        let mut parser = FrameParser::default();
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line) {
                Ok(0) => {
                    if !connection.is_closed() {
                        log::debug!(target: "flagsync", connection = connection.id; "flag stream closed by server, reconnecting");
                        self.reconnect(connection);
                    }
                    return;
                }
                Ok(_) => {
                    if connection.is_closed() {
                        return;
                    }
                    let Some(data) = parser.push_line(&line) else {
                        continue;
                    };
                    if data == KEEPALIVE_DATA {
                        log::trace!(target: "flagsync", connection = connection.id; "flag stream keepalive");
                        continue;
                    }
                    let on_data = self
                        .lock()
                        .callbacks
                        .as_ref()
                        .map(|callbacks| Arc::clone(&callbacks.on_data));
                    match on_data {
                        Some(on_data) if !connection.is_closed() => on_data(data),
                        _ => return,
                    }
                }
                Err(err) => {
                    self.fail(connection, StreamError::from_io(err));
                    return;
                }
            }
        }
    }
}

impl TransportState {
    fn is_current(&self, connection: &Arc<Connection>) -> bool {
        self.connection
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, connection))
            && !connection.is_closed()
    }
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        self.cancel();
    }
}
