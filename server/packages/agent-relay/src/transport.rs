//! Event-stream client for a running worker's `/event` endpoint.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agent_relay_error::RelayError;
use futures::StreamExt;
use reqwest::Client;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

const CONNECT_POLL: Duration = Duration::from_millis(20);

/// Text part of a message, carrying the part's full text so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextPart {
    pub id: String,
    pub session_id: String,
    pub message_id: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    PartUpdated(TextPart),
    SessionIdle(String),
}

type PartCallback = Box<dyn Fn(&TextPart) + Send + Sync>;
type IdleCallback = Box<dyn Fn(&str) + Send + Sync>;
type ErrorCallback = Box<dyn Fn(&RelayError) + Send + Sync>;

#[derive(Default)]
struct Subscribers {
    part_updated: Mutex<Vec<PartCallback>>,
    session_idle: Mutex<Vec<IdleCallback>>,
    error: Mutex<Vec<ErrorCallback>>,
}

impl Subscribers {
    fn dispatch(&self, event: &StreamEvent) {
        match event {
            StreamEvent::PartUpdated(part) => {
                for callback in lock(&self.part_updated).iter() {
                    callback(part);
                }
            }
            StreamEvent::SessionIdle(session_id) => {
                for callback in lock(&self.session_idle).iter() {
                    callback(session_id);
                }
            }
        }
    }

    fn error(&self, err: &RelayError) {
        for callback in lock(&self.error).iter() {
            callback(err);
        }
    }
}

struct Connection {
    task: JoinHandle<()>,
    open: Arc<AtomicBool>,
}

/// Subscribers must not register further subscribers from inside a callback.
#[derive(Clone)]
pub struct EventStreamClient {
    inner: Arc<ClientInner>,
}

impl Default for EventStreamClient {
    fn default() -> Self {
        Self::new(Client::new())
    }
}

struct ClientInner {
    http: Client,
    subscribers: Arc<Subscribers>,
    connection: Mutex<Option<Connection>>,
}

impl EventStreamClient {
    pub fn new(http: Client) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                http,
                subscribers: Arc::new(Subscribers::default()),
                connection: Mutex::new(None),
            }),
        }
    }

    pub fn on_part_updated(&self, callback: impl Fn(&TextPart) + Send + Sync + 'static) {
        lock(&self.inner.subscribers.part_updated).push(Box::new(callback));
    }

    pub fn on_session_idle(&self, callback: impl Fn(&str) + Send + Sync + 'static) {
        lock(&self.inner.subscribers.session_idle).push(Box::new(callback));
    }

    pub fn on_error(&self, callback: impl Fn(&RelayError) + Send + Sync + 'static) {
        lock(&self.inner.subscribers.error).push(Box::new(callback));
    }

    /// Opens `{base_url}/event` in a background task. Replaces any previous
    /// connection.
    pub fn connect(&self, base_url: &str) {
        self.disconnect();

        let url = format!("{}/event", base_url.trim_end_matches('/'));
        let open = Arc::new(AtomicBool::new(false));
        let http = self.inner.http.clone();
        let subscribers = self.inner.subscribers.clone();
        let task_open = open.clone();
        let task = tokio::spawn(async move {
            run_stream(http, subscribers, url, task_open).await;
        });

        *lock(&self.inner.connection) = Some(Connection { task, open });
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.inner.connection)
            .as_ref()
            .map(|connection| connection.open.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Waits up to `max_wait` for the stream to open. Returns the final state.
    pub async fn wait_connected(&self, max_wait: Duration) -> bool {
        let deadline = Instant::now() + max_wait;
        loop {
            if self.is_connected() {
                return true;
            }
            if Instant::now() >= deadline || !self.is_streaming() {
                return self.is_connected();
            }
            sleep(CONNECT_POLL).await;
        }
    }

    /// True while a stream task exists and has not ended.
    fn is_streaming(&self) -> bool {
        lock(&self.inner.connection)
            .as_ref()
            .map(|connection| !connection.task.is_finished())
            .unwrap_or(false)
    }

    pub fn disconnect(&self) {
        if let Some(connection) = lock(&self.inner.connection).take() {
            connection.open.store(false, Ordering::SeqCst);
            connection.task.abort();
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.connection.lock() {
            if let Some(connection) = guard.take() {
                connection.task.abort();
            }
        }
    }
}

async fn run_stream(
    http: Client,
    subscribers: Arc<Subscribers>,
    url: String,
    open: Arc<AtomicBool>,
) {
    let response = match http
        .get(&url)
        .header("accept", "text/event-stream")
        .send()
        .await
    {
        Ok(response) => response,
        Err(err) => {
            subscribers.error(&RelayError::transport_connection(err.to_string()));
            return;
        }
    };

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        subscribers.error(&RelayError::transport_connection(format!(
            "event stream returned {status}: {body}"
        )));
        return;
    }

    open.store(true, Ordering::SeqCst);
    debug!(url = %url, "event stream connected");

    let mut accumulator = SseAccumulator::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => {
                open.store(false, Ordering::SeqCst);
                subscribers.error(&RelayError::transport_connection(err.to_string()));
                return;
            }
        };
        for payload in accumulator.push(&chunk) {
            match payload.and_then(|payload| decode_event(&payload)) {
                Ok(Some(event)) => subscribers.dispatch(&event),
                Ok(None) => {}
                Err(err) => {
                    warn!(error = %err, "dropping malformed event");
                    subscribers.error(&err);
                }
            }
        }
    }

    open.store(false, Ordering::SeqCst);
    subscribers.error(&RelayError::transport_connection(
        "event stream closed by worker",
    ));
}

/// Decodes one event payload. Event types outside the relay's vocabulary
/// yield `Ok(None)`.
pub fn decode_event(payload: &str) -> Result<Option<StreamEvent>, RelayError> {
    let value: Value = serde_json::from_str(payload).map_err(|err| RelayError::TransportParse {
        message: err.to_string(),
    })?;
    let properties = value.get("properties");

    match value.get("type").and_then(Value::as_str) {
        Some("message.part.updated") => {
            let Some(part) = properties.and_then(|props| props.get("part")) else {
                return Ok(None);
            };
            if part.get("type").and_then(Value::as_str) != Some("text") {
                return Ok(None);
            }
            Ok(Some(StreamEvent::PartUpdated(TextPart {
                id: string_field(part, "id"),
                session_id: string_field(part, "sessionID"),
                message_id: string_field(part, "messageID"),
                text: string_field(part, "text"),
            })))
        }
        Some("session.idle") => Ok(properties
            .and_then(|props| props.get("sessionID"))
            .and_then(Value::as_str)
            .map(|id| StreamEvent::SessionIdle(id.to_string()))),
        _ => Ok(None),
    }
}

fn string_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Splits a server-sent-event byte stream into `data:` payloads. Bytes are
/// buffered until a full line arrives, so characters split across chunks
/// decode intact.
pub(crate) struct SseAccumulator {
    buffer: Vec<u8>,
    data_lines: Vec<String>,
}

impl SseAccumulator {
    pub(crate) fn new() -> Self {
        Self {
            buffer: Vec::new(),
            data_lines: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<Result<String, RelayError>> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let mut raw = self.buffer.drain(..=pos).collect::<Vec<u8>>();
            raw.pop();
            if raw.last() == Some(&b'\r') {
                raw.pop();
            }
            let line = match String::from_utf8(raw) {
                Ok(line) => line,
                Err(err) => {
                    events.push(Err(RelayError::TransportParse {
                        message: format!("invalid utf-8 in event stream: {err}"),
                    }));
                    continue;
                }
            };
            if line.is_empty() {
                if !self.data_lines.is_empty() {
                    events.push(Ok(self.data_lines.join("\n")));
                    self.data_lines.clear();
                }
                continue;
            }
            if let Some(data) = line.strip_prefix("data:") {
                self.data_lines.push(data.trim_start().to_string());
            }
        }
        events
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
