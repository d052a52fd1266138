#![allow(dead_code)]

use std::collections::HashSet;
use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agent_relay::notifier::ThreadNotifier;
use agent_relay::store::{ChannelBinding, MemoryStore, ProjectConfig};
use agent_relay::workspace::WorkspaceProvider;
use agent_relay::RelayError;
use agent_relay_worker_registry::{WorkerRegistry, WorkerRegistryConfig};
use axum::extract::{Path as UrlPath, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::future::BoxFuture;
use futures::{FutureExt, Stream};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::broadcast;

pub const CHANNEL: &str = "chan-1";
pub const PROJECT: &str = "web";

/// In-process stand-in for a coding-agent worker: session endpoints plus an
/// event stream that echoes each prompt back as text parts.
#[derive(Clone)]
pub struct FakeWorker {
    pub port: u16,
    state: Arc<WorkerState>,
}

struct WorkerState {
    events: broadcast::Sender<String>,
    sessions: Mutex<HashSet<String>>,
    prompts: Mutex<Vec<(String, String)>>,
    aborts: Mutex<Vec<String>>,
    next_session: AtomicUsize,
    hold: AtomicBool,
    reject_prompts: AtomicBool,
    reject_events: AtomicBool,
    reply_delay: Duration,
}

impl FakeWorker {
    pub async fn bind(port: u16) -> Self {
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
            .await
            .expect("bind fake worker");
        Self::serve(listener)
    }

    pub async fn ephemeral() -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fake worker");
        Self::serve(listener)
    }

    fn serve(listener: tokio::net::TcpListener) -> Self {
        let port = listener.local_addr().expect("local addr").port();
        let (events, _) = broadcast::channel(64);
        let state = Arc::new(WorkerState {
            events,
            sessions: Mutex::new(HashSet::new()),
            prompts: Mutex::new(Vec::new()),
            aborts: Mutex::new(Vec::new()),
            next_session: AtomicUsize::new(1),
            hold: AtomicBool::new(false),
            reject_prompts: AtomicBool::new(false),
            reject_events: AtomicBool::new(false),
            reply_delay: Duration::from_millis(40),
        });

        let app = Router::new()
            .route("/session", get(list_sessions).post(create_session))
            .route("/session/:id", get(get_session))
            .route("/session/:id/prompt_async", post(prompt_async))
            .route("/session/:id/abort", post(abort_session))
            .route("/event", get(event_stream))
            .with_state(state.clone());
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Self { port, state }
    }

    /// Keeps executions running until they are aborted.
    pub fn hold_replies(&self, hold: bool) {
        self.state.hold.store(hold, Ordering::SeqCst);
    }

    pub fn reject_prompts(&self, reject: bool) {
        self.state.reject_prompts.store(reject, Ordering::SeqCst);
    }

    /// Makes `/event` answer 500 instead of streaming.
    pub fn reject_events(&self, reject: bool) {
        self.state.reject_events.store(reject, Ordering::SeqCst);
    }

    /// Simulates a worker restart that lost its sessions.
    pub fn forget_sessions(&self) {
        self.state.sessions.lock().unwrap().clear();
    }

    pub fn prompts(&self) -> Vec<(String, String)> {
        self.state.prompts.lock().unwrap().clone()
    }

    pub fn aborts(&self) -> Vec<String> {
        self.state.aborts.lock().unwrap().clone()
    }

    pub fn session_count(&self) -> usize {
        self.state.sessions.lock().unwrap().len()
    }

    /// Publishes a raw payload on the event stream.
    pub fn emit(&self, payload: Value) {
        let _ = self.state.events.send(payload.to_string());
    }
}

fn part_event(session_id: &str, text: &str) -> Value {
    json!({
        "type": "message.part.updated",
        "properties": {
            "part": {
                "id": "prt_1",
                "sessionID": session_id,
                "messageID": "msg_1",
                "type": "text",
                "text": text,
            }
        }
    })
}

fn idle_event(session_id: &str) -> Value {
    json!({ "type": "session.idle", "properties": { "sessionID": session_id } })
}

async fn list_sessions(State(state): State<Arc<WorkerState>>) -> Json<Value> {
    let mut ids = state
        .sessions
        .lock()
        .unwrap()
        .iter()
        .cloned()
        .collect::<Vec<_>>();
    ids.sort();
    Json(Value::Array(
        ids.into_iter().map(|id| json!({ "id": id })).collect(),
    ))
}

async fn create_session(State(state): State<Arc<WorkerState>>) -> Json<Value> {
    let id = format!("ses_{}", state.next_session.fetch_add(1, Ordering::SeqCst));
    state.sessions.lock().unwrap().insert(id.clone());
    Json(json!({ "id": id }))
}

async fn get_session(
    State(state): State<Arc<WorkerState>>,
    UrlPath(id): UrlPath<String>,
) -> impl IntoResponse {
    if state.sessions.lock().unwrap().contains(&id) {
        (StatusCode::OK, Json(json!({ "id": id })))
    } else {
        (StatusCode::NOT_FOUND, Json(json!({ "error": "not found" })))
    }
}

async fn prompt_async(
    State(state): State<Arc<WorkerState>>,
    UrlPath(id): UrlPath<String>,
    Json(body): Json<Value>,
) -> StatusCode {
    if state.reject_prompts.load(Ordering::SeqCst) {
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    let text = body["parts"][0]["text"].as_str().unwrap_or_default().to_string();
    state.prompts.lock().unwrap().push((id.clone(), text.clone()));

    let hold = state.hold.load(Ordering::SeqCst);
    let events = state.events.clone();
    let delay = state.reply_delay;
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = events.send(part_event(&id, "Echo").to_string());
        if hold {
            return;
        }
        tokio::time::sleep(delay).await;
        let _ = events.send(part_event(&id, &format!("Echo: {text}")).to_string());
        let _ = events.send(idle_event(&id).to_string());
    });
    StatusCode::NO_CONTENT
}

async fn abort_session(
    State(state): State<Arc<WorkerState>>,
    UrlPath(id): UrlPath<String>,
) -> StatusCode {
    state.aborts.lock().unwrap().push(id.clone());
    let _ = state.events.send(idle_event(&id).to_string());
    StatusCode::OK
}

async fn event_stream(State(state): State<Arc<WorkerState>>) -> Response {
    if state.reject_events.load(Ordering::SeqCst) {
        return (StatusCode::INTERNAL_SERVER_ERROR, "event bus unavailable").into_response();
    }
    event_sse(&state).into_response()
}

fn event_sse(state: &WorkerState) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.events.subscribe();
    let stream = futures::stream::unfold(receiver, |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(payload) => return Some((Ok(Event::default().data(payload)), receiver)),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Note {
    Started { header: String, prompt: String },
    Completed { text: String, summary: String },
    Failed(String),
    Notice(String),
}

/// Records everything except progress frames, which are counted.
#[derive(Default)]
pub struct RecordingNotifier {
    notes: Mutex<Vec<Note>>,
    progress: AtomicUsize,
}

impl RecordingNotifier {
    pub fn notes(&self) -> Vec<Note> {
        self.notes.lock().unwrap().clone()
    }

    pub fn progress_count(&self) -> usize {
        self.progress.load(Ordering::SeqCst)
    }

    pub fn completed_texts(&self) -> Vec<String> {
        self.notes()
            .into_iter()
            .filter_map(|note| match note {
                Note::Completed { text, .. } => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn failures(&self) -> Vec<String> {
        self.notes()
            .into_iter()
            .filter_map(|note| match note {
                Note::Failed(message) => Some(message),
                _ => None,
            })
            .collect()
    }

    fn push(&self, note: Note) {
        self.notes.lock().unwrap().push(note);
    }
}

impl ThreadNotifier for RecordingNotifier {
    fn started(&self, _thread_id: &str, header: &str, prompt: &str) {
        self.push(Note::Started {
            header: header.to_string(),
            prompt: prompt.to_string(),
        });
    }

    fn progress(&self, _thread_id: &str, _frame: &str, _text: &str) {
        self.progress.fetch_add(1, Ordering::SeqCst);
    }

    fn completed(&self, _thread_id: &str, text: &str, summary: &str) {
        self.push(Note::Completed {
            text: text.to_string(),
            summary: summary.to_string(),
        });
    }

    fn failed(&self, _thread_id: &str, message: &str) {
        self.push(Note::Failed(message.to_string()));
    }

    fn notice(&self, _thread_id: &str, message: &str) {
        self.push(Note::Notice(message.to_string()));
    }
}

/// Workspace double that makes plain directories instead of git worktrees.
#[derive(Default)]
pub struct DirWorkspace {
    pub created: Mutex<Vec<(PathBuf, String)>>,
    pub removed: Mutex<Vec<PathBuf>>,
}

impl WorkspaceProvider for DirWorkspace {
    fn create_worktree<'a>(
        &'a self,
        project_path: &'a Path,
        branch: &'a str,
    ) -> BoxFuture<'a, Result<PathBuf, RelayError>> {
        async move {
            let path = project_path.join("worktrees").join(branch.replace('/', "-"));
            std::fs::create_dir_all(&path).map_err(|err| RelayError::Workspace {
                message: err.to_string(),
            })?;
            self.created
                .lock()
                .unwrap()
                .push((path.clone(), branch.to_string()));
            Ok(path)
        }
        .boxed()
    }

    fn current_branch<'a>(&'a self, _path: &'a Path) -> BoxFuture<'a, Option<String>> {
        async { Some("trunk".to_string()) }.boxed()
    }

    fn worktree_exists(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn remove_worktree<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<(), RelayError>> {
        async move {
            let _ = std::fs::remove_dir_all(path);
            self.removed.lock().unwrap().push(path.to_path_buf());
            Ok(())
        }
        .boxed()
    }
}

/// Registry whose "worker" is a placeholder process; the HTTP side is served
/// by a [`FakeWorker`] bound to the port the registry picked.
pub fn placeholder_registry(port_min: u16, port_max: u16, log_dir: &TempDir) -> WorkerRegistry {
    WorkerRegistry::new(WorkerRegistryConfig {
        port_min,
        port_max,
        program: PathBuf::from("sh"),
        args: vec!["-c".to_string(), "sleep 60".to_string()],
        log_dir: log_dir.path().to_path_buf(),
    })
}

pub fn project_store(project_path: &Path, auto_worktree: bool, model: Option<&str>) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store.add_project(ProjectConfig {
        alias: PROJECT.to_string(),
        path: project_path.to_path_buf(),
        auto_worktree,
    });
    store.bind_channel(ChannelBinding {
        channel_id: CHANNEL.to_string(),
        project_alias: PROJECT.to_string(),
        model: model.map(str::to_string),
    });
    store
}

/// Polls `check` until it holds or two seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
