//! Keyed state the relay reads and writes: thread sessions, queues, queue
//! settings, project bindings and worktree mappings.
//!
//! Persistence is the host's concern. [`MemoryStore`] keeps everything in
//! process and is what the CLI and the tests use.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadSession {
    pub thread_id: String,
    pub session_id: String,
    pub project_path: PathBuf,
    /// Worker port the session lives on; `0` for in-process sessions.
    pub port: u16,
    pub created_at: i64,
    pub last_used_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedPrompt {
    pub prompt: String,
    pub requester_id: String,
    pub timestamp: i64,
}

impl QueuedPrompt {
    pub fn new(prompt: impl Into<String>, requester_id: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            requester_id: requester_id.into(),
            timestamp: now_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSettings {
    pub paused: bool,
    pub continue_on_failure: bool,
    pub fresh_context: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectConfig {
    pub alias: String,
    pub path: PathBuf,
    #[serde(default)]
    pub auto_worktree: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelBinding {
    pub channel_id: String,
    pub project_alias: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorktreeMapping {
    pub thread_id: String,
    pub branch_name: String,
    pub worktree_path: PathBuf,
    pub project_path: PathBuf,
    pub description: String,
    pub created_at: i64,
}

/// Accessors over the relay's keyed state. Every call is atomic on its own.
pub trait RelayStore: Send + Sync {
    fn thread_session(&self, thread_id: &str) -> Option<ThreadSession>;
    fn set_thread_session(&self, session: ThreadSession);
    fn touch_thread_session(&self, thread_id: &str, at: i64);
    fn clear_thread_session(&self, thread_id: &str);

    fn push_queue(&self, thread_id: &str, prompt: QueuedPrompt) -> usize;
    fn pop_queue(&self, thread_id: &str) -> Option<QueuedPrompt>;
    fn queue(&self, thread_id: &str) -> Vec<QueuedPrompt>;
    fn clear_queue(&self, thread_id: &str) -> usize;

    fn queue_settings(&self, thread_id: &str) -> QueueSettings;
    fn set_queue_settings(&self, thread_id: &str, settings: QueueSettings);

    fn project(&self, alias: &str) -> Option<ProjectConfig>;
    fn channel_binding(&self, channel_id: &str) -> Option<ChannelBinding>;

    fn worktree_mapping(&self, thread_id: &str) -> Option<WorktreeMapping>;
    fn set_worktree_mapping(&self, mapping: WorktreeMapping);
    fn clear_worktree_mapping(&self, thread_id: &str) -> Option<WorktreeMapping>;

    fn channel_project(&self, channel_id: &str) -> Option<ProjectConfig> {
        let binding = self.channel_binding(channel_id)?;
        self.project(&binding.project_alias)
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    data: Mutex<MemoryData>,
}

#[derive(Debug, Default)]
struct MemoryData {
    sessions: HashMap<String, ThreadSession>,
    queues: HashMap<String, VecDeque<QueuedPrompt>>,
    settings: HashMap<String, QueueSettings>,
    projects: HashMap<String, ProjectConfig>,
    bindings: HashMap<String, ChannelBinding>,
    worktrees: HashMap<String, WorktreeMapping>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_project(&self, project: ProjectConfig) {
        self.with(|data| {
            data.projects.insert(project.alias.clone(), project);
        })
    }

    pub fn bind_channel(&self, binding: ChannelBinding) {
        self.with(|data| {
            data.bindings.insert(binding.channel_id.clone(), binding);
        })
    }

    fn with<T>(&self, f: impl FnOnce(&mut MemoryData) -> T) -> T {
        let mut guard = match self.data.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }
}

impl RelayStore for MemoryStore {
    fn thread_session(&self, thread_id: &str) -> Option<ThreadSession> {
        self.with(|data| data.sessions.get(thread_id).cloned())
    }

    fn set_thread_session(&self, session: ThreadSession) {
        self.with(|data| {
            data.sessions.insert(session.thread_id.clone(), session);
        })
    }

    fn touch_thread_session(&self, thread_id: &str, at: i64) {
        self.with(|data| {
            if let Some(session) = data.sessions.get_mut(thread_id) {
                session.last_used_at = at;
            }
        })
    }

    fn clear_thread_session(&self, thread_id: &str) {
        self.with(|data| {
            data.sessions.remove(thread_id);
        })
    }

    fn push_queue(&self, thread_id: &str, prompt: QueuedPrompt) -> usize {
        self.with(|data| {
            let queue = data.queues.entry(thread_id.to_string()).or_default();
            queue.push_back(prompt);
            queue.len()
        })
    }

    fn pop_queue(&self, thread_id: &str) -> Option<QueuedPrompt> {
        self.with(|data| {
            let queue = data.queues.get_mut(thread_id)?;
            let prompt = queue.pop_front();
            if queue.is_empty() {
                data.queues.remove(thread_id);
            }
            prompt
        })
    }

    fn queue(&self, thread_id: &str) -> Vec<QueuedPrompt> {
        self.with(|data| {
            data.queues
                .get(thread_id)
                .map(|queue| queue.iter().cloned().collect())
                .unwrap_or_default()
        })
    }

    fn clear_queue(&self, thread_id: &str) -> usize {
        self.with(|data| {
            data.queues
                .remove(thread_id)
                .map(|queue| queue.len())
                .unwrap_or(0)
        })
    }

    fn queue_settings(&self, thread_id: &str) -> QueueSettings {
        self.with(|data| data.settings.get(thread_id).copied().unwrap_or_default())
    }

    fn set_queue_settings(&self, thread_id: &str, settings: QueueSettings) {
        self.with(|data| {
            data.settings.insert(thread_id.to_string(), settings);
        })
    }

    fn project(&self, alias: &str) -> Option<ProjectConfig> {
        self.with(|data| data.projects.get(alias).cloned())
    }

    fn channel_binding(&self, channel_id: &str) -> Option<ChannelBinding> {
        self.with(|data| data.bindings.get(channel_id).cloned())
    }

    fn worktree_mapping(&self, thread_id: &str) -> Option<WorktreeMapping> {
        self.with(|data| data.worktrees.get(thread_id).cloned())
    }

    fn set_worktree_mapping(&self, mapping: WorktreeMapping) {
        self.with(|data| {
            data.worktrees.insert(mapping.thread_id.clone(), mapping);
        })
    }

    fn clear_worktree_mapping(&self, thread_id: &str) -> Option<WorktreeMapping> {
        self.with(|data| data.worktrees.remove(thread_id))
    }
}
