//! Session registry: worker-side session calls plus the thread to session
//! mapping and the resume policy built on both.

use std::path::Path;
use std::sync::Arc;

use agent_relay_error::RelayError;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::store::{now_ms, RelayStore, ThreadSession};

pub fn worker_base_url(port: u16) -> String {
    format!("http://localhost:{port}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// HTTP calls against a worker's session endpoints.
#[derive(Debug, Clone, Default)]
pub struct SessionClient {
    http: Client,
}

impl SessionClient {
    pub fn new(http: Client) -> Self {
        Self { http }
    }

    pub async fn create_session(&self, port: u16) -> Result<String, RelayError> {
        let response = self
            .http
            .post(format!("{}/session", worker_base_url(port)))
            .json(&json!({}))
            .send()
            .await
            .map_err(|err| RelayError::SessionCreateFailed {
                message: err.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RelayError::SessionCreateFailed {
                message: format!("{status}: {body}"),
            });
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|err| RelayError::SessionCreateFailed {
                message: err.to_string(),
            })?;
        payload
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .ok_or_else(|| RelayError::SessionCreateFailed {
                message: "response did not include a session id".to_string(),
            })
    }

    /// Best-effort existence check; any failure reads as "gone".
    pub async fn validate_session(&self, port: u16, session_id: &str) -> bool {
        match self
            .http
            .get(format!("{}/session/{session_id}", worker_base_url(port)))
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(err) => {
                debug!(port, session_id, error = %err, "session validation failed");
                false
            }
        }
    }

    pub async fn list_sessions(&self, port: u16) -> Result<Vec<SessionInfo>, RelayError> {
        let response = self
            .http
            .get(format!("{}/session", worker_base_url(port)))
            .send()
            .await
            .map_err(|err| RelayError::transport_connection(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::transport_connection(format!(
                "session list returned {status}"
            )));
        }
        response
            .json::<Vec<SessionInfo>>()
            .await
            .map_err(|err| RelayError::TransportParse {
                message: err.to_string(),
            })
    }

    pub async fn send_prompt(
        &self,
        port: u16,
        session_id: &str,
        text: &str,
    ) -> Result<(), RelayError> {
        let body = json!({ "parts": [{ "type": "text", "text": text }] });
        let response = self
            .http
            .post(format!(
                "{}/session/{session_id}/prompt_async",
                worker_base_url(port)
            ))
            .json(&body)
            .send()
            .await
            .map_err(|err| RelayError::PromptSendFailed {
                session_id: session_id.to_string(),
                message: err.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RelayError::PromptSendFailed {
                session_id: session_id.to_string(),
                message: format!("{status}: {body}"),
            });
        }
        Ok(())
    }

    pub async fn abort_session(&self, port: u16, session_id: &str) -> bool {
        match self
            .http
            .post(format!("{}/session/{session_id}/abort", worker_base_url(port)))
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(err) => {
                debug!(port, session_id, error = %err, "session abort failed");
                false
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSession {
    pub session_id: String,
    pub resumed: bool,
}

/// Thread to session mapping over the relay store, with the resume policy.
#[derive(Clone)]
pub struct SessionRegistry {
    store: Arc<dyn RelayStore>,
    client: SessionClient,
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn RelayStore>, client: SessionClient) -> Self {
        Self { store, client }
    }

    pub fn client(&self) -> &SessionClient {
        &self.client
    }

    pub fn get_session_for_thread(&self, thread_id: &str) -> Option<ThreadSession> {
        self.store.thread_session(thread_id)
    }

    pub fn set_session_for_thread(
        &self,
        thread_id: &str,
        session_id: &str,
        project_path: &Path,
        port: u16,
    ) {
        let now = now_ms();
        self.store.set_thread_session(ThreadSession {
            thread_id: thread_id.to_string(),
            session_id: session_id.to_string(),
            project_path: project_path.to_path_buf(),
            port,
            created_at: now,
            last_used_at: now,
        });
    }

    pub fn update_last_used(&self, thread_id: &str) {
        self.store.touch_thread_session(thread_id, now_ms());
    }

    pub fn clear_session(&self, thread_id: &str) {
        self.store.clear_thread_session(thread_id);
    }

    /// Records the session a backend reported at start-up. An unchanged id only
    /// refreshes `last_used_at`; anything else replaces the mapping.
    pub fn record_session_init(
        &self,
        thread_id: &str,
        session_id: &str,
        project_path: &Path,
        port: u16,
    ) {
        match self.store.thread_session(thread_id) {
            Some(existing)
                if existing.session_id == session_id && existing.project_path == project_path =>
            {
                self.update_last_used(thread_id);
            }
            _ => self.set_session_for_thread(thread_id, session_id, project_path, port),
        }
    }

    /// Stored session id, if it was created for `effective_path`.
    pub fn resume_candidate(&self, thread_id: &str, effective_path: &Path) -> Option<String> {
        self.store
            .thread_session(thread_id)
            .filter(|session| session.project_path == effective_path)
            .map(|session| session.session_id)
    }

    /// Reuses the stored session when it belongs to `effective_path` and the
    /// worker still knows it; otherwise creates one and overwrites the mapping.
    pub async fn resolve(
        &self,
        thread_id: &str,
        effective_path: &Path,
        port: u16,
    ) -> Result<ResolvedSession, RelayError> {
        if let Some(session_id) = self.resume_candidate(thread_id, effective_path) {
            if self.client.validate_session(port, &session_id).await {
                self.update_last_used(thread_id);
                debug!(thread_id, session_id = %session_id, "resuming session");
                return Ok(ResolvedSession {
                    session_id,
                    resumed: true,
                });
            }
        }

        let session_id = self.client.create_session(port).await?;
        self.set_session_for_thread(thread_id, &session_id, effective_path, port);
        info!(
            thread_id,
            session_id = %session_id,
            path = %effective_path.display(),
            "created session"
        );
        Ok(ResolvedSession {
            session_id,
            resumed: false,
        })
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("client", &self.client)
            .finish_non_exhaustive()
    }
}
