use std::sync::{Arc, Mutex};
use std::time::Duration;

use agent_relay_error::RelayError;
use agent_relay_worker_registry::WorkerRegistry;
use reqwest::Client;
use tokio::sync::Notify;
use tracing::{debug, info};

use super::{lock, ExecutionCallbacks, ExecutionRequest, ExecutionResult, ExecutionState, Lifecycle};
use crate::session::{worker_base_url, SessionRegistry};
use crate::transport::EventStreamClient;

const CONNECT_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
struct ActiveSession {
    port: u16,
    session_id: String,
}

/// One prompt sent to the project's worker, followed over its event stream.
pub struct RemoteExecution {
    registry: WorkerRegistry,
    sessions: SessionRegistry,
    readiness_timeout: Duration,
    state: ExecutionState,
    active: Mutex<Option<ActiveSession>>,
    transport: EventStreamClient,
}

impl RemoteExecution {
    pub fn new(
        registry: WorkerRegistry,
        sessions: SessionRegistry,
        readiness_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            sessions,
            readiness_timeout,
            state: ExecutionState::default(),
            active: Mutex::new(None),
            transport: EventStreamClient::new(Client::new()),
        }
    }

    pub fn state(&self) -> &ExecutionState {
        &self.state
    }

    pub async fn start(
        &self,
        request: ExecutionRequest,
        callbacks: Arc<dyn ExecutionCallbacks>,
    ) -> Result<(), RelayError> {
        let lifecycle = Lifecycle::new(self.state.clone(), callbacks);

        let port = self.registry.spawn_worker(&request.workspace_path).await?;
        self.registry
            .wait_for_ready(port, self.readiness_timeout)
            .await?;

        let resolved = self
            .sessions
            .resolve(&request.thread_id, &request.workspace_path, port)
            .await?;
        let session_id = resolved.session_id;
        self.state.set_session_id(&session_id);
        *lock(&self.active) = Some(ActiveSession {
            port,
            session_id: session_id.clone(),
        });
        lifecycle.session_init(&session_id);
        if self.state.is_completed() {
            debug!(port, session_id = %session_id, "execution ended during setup; prompt not sent");
            return Ok(());
        }

        let finished = Arc::new(Notify::new());
        self.subscribe(&lifecycle, &session_id, &finished);
        self.transport.connect(&worker_base_url(port));

        let transport = self.transport.clone();
        let watcher = finished.clone();
        tokio::spawn(async move {
            watcher.notified().await;
            transport.disconnect();
        });

        if !self.transport.wait_connected(CONNECT_GRACE).await {
            debug!(port, "event stream not open yet; sending prompt anyway");
        }
        // A stream failure already reported the execution as failed.
        if self.state.is_completed() {
            finished.notify_one();
            debug!(port, session_id = %session_id, "execution ended before send; prompt not sent");
            return Ok(());
        }

        if let Err(err) = self
            .sessions
            .client()
            .send_prompt(port, &session_id, &request.prompt)
            .await
        {
            lifecycle.abandon();
            finished.notify_one();
            return Err(err);
        }

        info!(
            thread_id = %request.thread_id,
            session_id = %session_id,
            port,
            resumed = resolved.resumed,
            "prompt sent to worker"
        );
        Ok(())
    }

    fn subscribe(&self, lifecycle: &Lifecycle, session_id: &str, finished: &Arc<Notify>) {
        let state = self.state.clone();
        let own_session = session_id.to_string();
        self.transport.on_part_updated(move |part| {
            if part.session_id == own_session {
                state.replace_text(&part.text);
            }
        });

        let state = self.state.clone();
        let own_session = session_id.to_string();
        let on_idle = lifecycle.clone();
        let idle_finished = finished.clone();
        self.transport.on_session_idle(move |idle_session| {
            if idle_session != own_session {
                return;
            }
            on_idle.complete(ExecutionResult {
                text: state.accumulated_text(),
                ..ExecutionResult::default()
            });
            idle_finished.notify_one();
        });

        let on_error = lifecycle.clone();
        let error_finished = finished.clone();
        self.transport.on_error(move |err| {
            on_error.fail(err.clone());
            error_finished.notify_one();
        });
    }

    pub async fn interrupt(&self) -> bool {
        if self.state.is_completed() {
            return false;
        }
        let Some(active) = lock(&self.active).clone() else {
            return false;
        };
        self.sessions
            .client()
            .abort_session(active.port, &active.session_id)
            .await
    }
}
