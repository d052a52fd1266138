//! Drives one prompt through a backend and reports its lifecycle.
//!
//! Two backend styles sit behind [`Execution`]: a per-project HTTP worker
//! ([`RemoteExecution`]) and the agent CLI streaming `stream-json` output
//! ([`LocalExecution`]). The style is chosen once from [`BackendKind`].
//!
//! `start` returns setup failures directly. Everything after setup is
//! reported through [`ExecutionCallbacks`] from a background task, and at most
//! one terminal callback fires per execution.

mod accumulator;
mod local;
mod remote;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agent_relay_error::RelayError;
use agent_relay_worker_registry::WorkerRegistry;
use serde::{Deserialize, Serialize};

use crate::session::SessionRegistry;

pub use local::LocalExecution;
pub use remote::RemoteExecution;

pub const DEFAULT_QUERY_PROGRAM: &str = "claude";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Per-project worker reached over HTTP and an event stream.
    #[default]
    Remote,
    /// Agent CLI run in the workspace, one process per prompt.
    Local,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_turns: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    pub thread_id: String,
    pub workspace_path: PathBuf,
    pub prompt: String,
    pub model: Option<String>,
}

pub trait ExecutionCallbacks: Send + Sync {
    fn on_session_init(&self, session_id: &str);
    fn on_complete(&self, result: ExecutionResult);
    fn on_error(&self, error: RelayError);
}

/// Transient per-execution state, shared with whoever samples progress.
#[derive(Debug, Clone, Default)]
pub struct ExecutionState {
    inner: Arc<StateInner>,
}

#[derive(Debug, Default)]
struct StateInner {
    text: Mutex<String>,
    session_id: Mutex<Option<String>>,
    completed: AtomicBool,
}

impl ExecutionState {
    pub fn accumulated_text(&self) -> String {
        lock(&self.inner.text).clone()
    }

    pub fn session_id(&self) -> Option<String> {
        lock(&self.inner.session_id).clone()
    }

    pub fn is_completed(&self) -> bool {
        self.inner.completed.load(Ordering::SeqCst)
    }

    pub(crate) fn set_session_id(&self, session_id: &str) {
        *lock(&self.inner.session_id) = Some(session_id.to_string());
    }

    pub(crate) fn replace_text(&self, text: &str) {
        let mut guard = lock(&self.inner.text);
        guard.clear();
        guard.push_str(text);
    }

    pub(crate) fn append_text(&self, text: &str) {
        lock(&self.inner.text).push_str(text);
    }

    /// Replaces the buffer with `turn` unless the buffer already ends with it.
    pub(crate) fn correct_text(&self, turn: &str) {
        let mut guard = lock(&self.inner.text);
        if !guard.ends_with(turn) {
            guard.clear();
            guard.push_str(turn);
        }
    }

    /// Returns true for the first caller only.
    pub(crate) fn mark_completed(&self) -> bool {
        !self.inner.completed.swap(true, Ordering::SeqCst)
    }
}

/// Wraps the caller's callbacks so only the first terminal event gets through.
#[derive(Clone)]
pub(crate) struct Lifecycle {
    state: ExecutionState,
    callbacks: Arc<dyn ExecutionCallbacks>,
}

impl Lifecycle {
    pub(crate) fn new(state: ExecutionState, callbacks: Arc<dyn ExecutionCallbacks>) -> Self {
        Self { state, callbacks }
    }

    pub(crate) fn session_init(&self, session_id: &str) {
        if !self.state.is_completed() {
            self.callbacks.on_session_init(session_id);
        }
    }

    pub(crate) fn complete(&self, result: ExecutionResult) {
        if self.state.mark_completed() {
            self.callbacks.on_complete(result);
        }
    }

    pub(crate) fn fail(&self, error: RelayError) {
        if self.state.mark_completed() {
            self.callbacks.on_error(error);
        }
    }

    /// Silences any later callbacks without reporting.
    pub(crate) fn abandon(&self) {
        self.state.mark_completed();
    }
}

/// Everything an execution needs from the surrounding relay.
#[derive(Debug, Clone)]
pub struct ExecutionBackend {
    pub kind: BackendKind,
    pub registry: WorkerRegistry,
    pub sessions: SessionRegistry,
    pub readiness_timeout: Duration,
    pub query_program: PathBuf,
}

pub enum Execution {
    Remote(RemoteExecution),
    Local(LocalExecution),
}

impl Execution {
    pub fn new(backend: &ExecutionBackend) -> Self {
        match backend.kind {
            BackendKind::Remote => Self::Remote(RemoteExecution::new(
                backend.registry.clone(),
                backend.sessions.clone(),
                backend.readiness_timeout,
            )),
            BackendKind::Local => Self::Local(LocalExecution::new(
                backend.query_program.clone(),
                backend.sessions.clone(),
            )),
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Remote(_) => BackendKind::Remote,
            Self::Local(_) => BackendKind::Local,
        }
    }

    pub async fn start(
        &self,
        request: ExecutionRequest,
        callbacks: Arc<dyn ExecutionCallbacks>,
    ) -> Result<(), RelayError> {
        match self {
            Self::Remote(execution) => execution.start(request, callbacks).await,
            Self::Local(execution) => execution.start(request, callbacks).await,
        }
    }

    /// Best-effort cancellation. The terminal callback still arrives through
    /// the normal path.
    pub async fn interrupt(&self) -> bool {
        match self {
            Self::Remote(execution) => execution.interrupt().await,
            Self::Local(execution) => execution.interrupt(),
        }
    }

    pub fn state(&self) -> &ExecutionState {
        match self {
            Self::Remote(execution) => execution.state(),
            Self::Local(execution) => execution.state(),
        }
    }

    pub fn accumulated_text(&self) -> String {
        self.state().accumulated_text()
    }

    pub fn is_completed(&self) -> bool {
        self.state().is_completed()
    }
}

impl std::fmt::Debug for Execution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Execution")
            .field("kind", &self.kind())
            .field("state", self.state())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
