//! Thread-level orchestration: decides whether a prompt runs or waits, starts
//! executions in the right workspace, samples progress and hands off to the
//! next queued prompt when an execution ends.
//!
//! The active table holds one slot per thread. A slot is claimed before any
//! work starts and is only handed to the next prompt, or released, by the run
//! that owns it. That slot is the busy predicate.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agent_relay_error::RelayError;
use agent_relay_worker_registry::WorkerRegistry;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::execution::{
    BackendKind, Execution, ExecutionBackend, ExecutionCallbacks, ExecutionRequest,
    ExecutionResult, DEFAULT_QUERY_PROGRAM,
};
use crate::notifier::{
    context_header, done_summary, spinner_frame, ThreadNotifier, PROCESSING_PLACEHOLDER,
    QUEUE_CLEARED_NOTICE,
};
use crate::queue::{ExecutionOutcome, PromptRunner, QueueAdvance, ThreadQueue};
use crate::session::{SessionClient, SessionRegistry};
use crate::store::{now_ms, ProjectConfig, QueuedPrompt, RelayStore, WorktreeMapping};
use crate::workspace::{sanitize_branch_name, WorkspaceProvider};

pub const DEFAULT_READINESS_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_PROGRESS_INTERVAL_MS: u64 = 1_000;
const DEFAULT_BRANCH: &str = "main";
const DEFAULT_MODEL_LABEL: &str = "default";

#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub backend: BackendKind,
    pub readiness_timeout: Duration,
    pub query_program: PathBuf,
    pub progress_interval: Duration,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            readiness_timeout: Duration::from_millis(DEFAULT_READINESS_TIMEOUT_MS),
            query_program: PathBuf::from(DEFAULT_QUERY_PROGRAM),
            progress_interval: Duration::from_millis(DEFAULT_PROGRESS_INTERVAL_MS),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    Started,
    Queued { position: usize },
}

struct ActiveSlot {
    run_id: u64,
    execution: Option<Arc<Execution>>,
}

impl ActiveSlot {
    fn reserved(run_id: u64) -> Self {
        Self {
            run_id,
            execution: None,
        }
    }

    fn is_busy(&self) -> bool {
        self.execution
            .as_ref()
            .map(|execution| !execution.is_completed())
            .unwrap_or(true)
    }
}

#[derive(Clone)]
pub struct Relay {
    inner: Arc<RelayInner>,
}

struct RelayInner {
    store: Arc<dyn RelayStore>,
    backend: ExecutionBackend,
    queue: ThreadQueue,
    workspace: Arc<dyn WorkspaceProvider>,
    notifier: Arc<dyn ThreadNotifier>,
    progress_interval: Duration,
    active: Mutex<HashMap<String, ActiveSlot>>,
    next_run_id: AtomicU64,
    settled: Notify,
}

impl Relay {
    pub fn new(
        store: Arc<dyn RelayStore>,
        registry: WorkerRegistry,
        workspace: Arc<dyn WorkspaceProvider>,
        notifier: Arc<dyn ThreadNotifier>,
        settings: RelaySettings,
    ) -> Self {
        let sessions = SessionRegistry::new(store.clone(), SessionClient::default());
        Self {
            inner: Arc::new(RelayInner {
                queue: ThreadQueue::new(store.clone()),
                store,
                backend: ExecutionBackend {
                    kind: settings.backend,
                    registry,
                    sessions,
                    readiness_timeout: settings.readiness_timeout,
                    query_program: settings.query_program,
                },
                workspace,
                notifier,
                progress_interval: settings.progress_interval,
                active: Mutex::new(HashMap::new()),
                next_run_id: AtomicU64::new(1),
                settled: Notify::new(),
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn RelayStore> {
        &self.inner.store
    }

    pub fn queue(&self) -> &ThreadQueue {
        &self.inner.queue
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.inner.backend.sessions
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.inner.backend.registry
    }

    /// Runs `prompt` now if the thread is idle with an empty queue, otherwise
    /// appends it to the thread's queue.
    pub fn submit(
        &self,
        thread_id: &str,
        channel_id: &str,
        prompt: &str,
        requester_id: &str,
    ) -> Submission {
        let prompt = QueuedPrompt::new(prompt, requester_id);
        let run_id = {
            let mut active = self.lock_active();
            let busy = active
                .get(thread_id)
                .map(ActiveSlot::is_busy)
                .unwrap_or(false);
            if busy || !self.inner.queue.is_empty(thread_id) {
                let position = self.inner.queue.enqueue(thread_id, prompt);
                return Submission::Queued { position };
            }
            let run_id = self.next_run_id();
            active.insert(thread_id.to_string(), ActiveSlot::reserved(run_id));
            run_id
        };

        self.spawn_run(thread_id, channel_id, prompt, run_id);
        Submission::Started
    }

    /// Starts the next queued prompt if the thread is free, e.g. after the
    /// queue was unpaused. Returns whether a prompt was dispatched.
    pub fn drive_queue(&self, thread_id: &str, channel_id: &str) -> bool {
        let run_id = {
            let mut active = self.lock_active();
            if active.contains_key(thread_id) || self.inner.queue.is_empty(thread_id) {
                return false;
            }
            let run_id = self.next_run_id();
            active.insert(thread_id.to_string(), ActiveSlot::reserved(run_id));
            run_id
        };
        self.settle(thread_id, channel_id, run_id)
    }

    pub fn is_busy(&self, thread_id: &str) -> bool {
        self.lock_active()
            .get(thread_id)
            .map(ActiveSlot::is_busy)
            .unwrap_or(false)
    }

    /// Latest accumulated text of the thread's running execution.
    pub fn progress(&self, thread_id: &str) -> Option<String> {
        self.active_execution(thread_id)
            .map(|execution| execution.accumulated_text())
    }

    pub async fn interrupt(&self, thread_id: &str) -> bool {
        match self.active_execution(thread_id) {
            Some(execution) => execution.interrupt().await,
            None => false,
        }
    }

    /// Resolves once the thread has no claimed slot and nothing runnable is queued.
    pub async fn wait_idle(&self, thread_id: &str) {
        loop {
            let notified = self.inner.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_settled(thread_id) {
                return;
            }
            notified.await;
        }
    }

    /// Removes the thread's worktree and forgets the mapping.
    pub async fn discard_worktree(&self, thread_id: &str) -> Result<bool, RelayError> {
        let Some(mapping) = self.inner.store.clear_worktree_mapping(thread_id) else {
            return Ok(false);
        };
        if self
            .sessions()
            .resume_candidate(thread_id, &mapping.worktree_path)
            .is_some()
        {
            self.sessions().clear_session(thread_id);
        }
        self.inner
            .workspace
            .remove_worktree(&mapping.worktree_path)
            .await?;
        info!(thread_id, branch = %mapping.branch_name, "worktree removed");
        Ok(true)
    }

    pub async fn shutdown(&self) {
        self.inner.backend.registry.stop_all().await;
    }

    fn spawn_run(&self, thread_id: &str, channel_id: &str, prompt: QueuedPrompt, run_id: u64) {
        let relay = self.clone();
        let thread_id = thread_id.to_string();
        let channel_id = channel_id.to_string();
        tokio::spawn(async move {
            relay.execute(&thread_id, &channel_id, prompt, run_id).await;
        });
    }

    async fn execute(&self, thread_id: &str, channel_id: &str, prompt: QueuedPrompt, run_id: u64) {
        let ticker = Arc::new(TickerGuard::default());
        let Err(err) = self
            .launch(thread_id, channel_id, &prompt.prompt, run_id, &ticker)
            .await
        else {
            return;
        };

        ticker.clear();
        if !self.owns(thread_id, run_id) {
            return;
        }
        warn!(
            thread_id,
            error_type = err.error_type().as_urn(),
            error = %err,
            "execution setup failed"
        );
        self.inner.notifier.failed(thread_id, &failure_message(&err));
        self.finish(thread_id, channel_id, run_id, ExecutionOutcome::Failed);
    }

    async fn launch(
        &self,
        thread_id: &str,
        channel_id: &str,
        prompt: &str,
        run_id: u64,
        ticker: &Arc<TickerGuard>,
    ) -> Result<(), RelayError> {
        let project =
            self.inner
                .store
                .channel_project(channel_id)
                .ok_or_else(|| RelayError::ProjectNotBound {
                    channel_id: channel_id.to_string(),
                })?;
        let model = self
            .inner
            .store
            .channel_binding(channel_id)
            .and_then(|binding| binding.model);

        let (workspace_path, mapped_branch) = self.effective_path(thread_id, &project, prompt).await;
        let branch = match mapped_branch {
            Some(branch) => branch,
            None => self
                .inner
                .workspace
                .current_branch(&workspace_path)
                .await
                .unwrap_or_else(|| DEFAULT_BRANCH.to_string()),
        };
        let header = context_header(&branch, model.as_deref().unwrap_or(DEFAULT_MODEL_LABEL));
        self.inner.notifier.started(thread_id, &header, prompt);

        if self.inner.queue.settings(thread_id).fresh_context {
            self.sessions().clear_session(thread_id);
        }

        let execution = Arc::new(Execution::new(&self.inner.backend));
        if !self.attach(thread_id, run_id, execution.clone()) {
            debug!(thread_id, run_id, "run superseded before start");
            return Ok(());
        }
        ticker.set(self.spawn_ticker(thread_id, execution.clone()));

        let callbacks = Arc::new(RunCallbacks {
            relay: self.clone(),
            thread_id: thread_id.to_string(),
            channel_id: channel_id.to_string(),
            run_id,
            workspace_path: workspace_path.clone(),
            ticker: ticker.clone(),
        });
        execution
            .start(
                ExecutionRequest {
                    thread_id: thread_id.to_string(),
                    workspace_path,
                    prompt: prompt.to_string(),
                    model,
                },
                callbacks,
            )
            .await
    }

    /// Worktree mapped to the thread, a fresh auto-worktree, or the project path.
    async fn effective_path(
        &self,
        thread_id: &str,
        project: &ProjectConfig,
        prompt: &str,
    ) -> (PathBuf, Option<String>) {
        if let Some(mapping) = self.inner.store.worktree_mapping(thread_id) {
            if self.inner.workspace.worktree_exists(&mapping.worktree_path) {
                return (mapping.worktree_path, Some(mapping.branch_name));
            }
            warn!(
                thread_id,
                path = %mapping.worktree_path.display(),
                "mapped worktree is gone; dropping mapping"
            );
            self.inner.store.clear_worktree_mapping(thread_id);
        }

        if project.auto_worktree {
            let short_id = thread_id.chars().take(8).collect::<String>();
            let branch = sanitize_branch_name(&format!("auto/{short_id}-{}", now_ms()));
            match self
                .inner
                .workspace
                .create_worktree(&project.path, &branch)
                .await
            {
                Ok(worktree_path) => {
                    self.inner.store.set_worktree_mapping(WorktreeMapping {
                        thread_id: thread_id.to_string(),
                        branch_name: branch.clone(),
                        worktree_path: worktree_path.clone(),
                        project_path: project.path.clone(),
                        description: describe(prompt),
                        created_at: now_ms(),
                    });
                    self.inner
                        .notifier
                        .notice(thread_id, &format!("🌳 Auto-worktree: {branch}"));
                    return (worktree_path, Some(branch));
                }
                Err(err) => {
                    warn!(thread_id, error = %err, "auto-worktree creation failed");
                }
            }
        }

        (project.path.clone(), None)
    }

    fn spawn_ticker(&self, thread_id: &str, execution: Arc<Execution>) -> JoinHandle<()> {
        let notifier = self.inner.notifier.clone();
        let period = self.inner.progress_interval;
        let thread_id = thread_id.to_string();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await;

            let mut tick: u64 = 0;
            let mut last = String::new();
            loop {
                interval.tick().await;
                if execution.is_completed() {
                    break;
                }
                tick += 1;
                let text = execution.accumulated_text();
                let content = if text.is_empty() {
                    PROCESSING_PLACEHOLDER.to_string()
                } else {
                    text
                };
                if content != last || tick % 2 == 0 {
                    notifier.progress(&thread_id, spinner_frame(tick), &content);
                    last = content;
                }
            }
        })
    }

    /// Hands the thread's slot from the finished run to the next queued prompt,
    /// or releases it.
    fn finish(&self, thread_id: &str, channel_id: &str, run_id: u64, outcome: ExecutionOutcome) {
        let next_run = {
            let mut active = self.lock_active();
            match active.get_mut(thread_id) {
                Some(slot) if slot.run_id == run_id => {
                    let next_run = self.next_run_id();
                    *slot = ActiveSlot::reserved(next_run);
                    next_run
                }
                _ => return,
            }
        };

        let dispatch = Dispatch {
            relay: self,
            run_id: next_run,
        };
        match self
            .inner
            .queue
            .advance(thread_id, channel_id, outcome, &dispatch)
        {
            QueueAdvance::Dispatched => {}
            QueueAdvance::Halted { discarded } => {
                debug!(thread_id, discarded, "queue halted after failure");
                self.inner.notifier.notice(thread_id, QUEUE_CLEARED_NOTICE);
                self.settle(thread_id, channel_id, next_run);
            }
            QueueAdvance::Idle | QueueAdvance::Paused => {
                self.settle(thread_id, channel_id, next_run);
            }
        }
    }

    /// Releases a reserved slot, unless prompts arrived while it was held; those
    /// are dispatched under the same reservation. Returns whether one was.
    fn settle(&self, thread_id: &str, channel_id: &str, run_id: u64) -> bool {
        loop {
            if self.release_if_drained(thread_id, run_id) {
                self.inner.settled.notify_waiters();
                return false;
            }
            let dispatch = Dispatch {
                relay: self,
                run_id,
            };
            if self
                .inner
                .queue
                .process_next(thread_id, channel_id, &dispatch)
                == QueueAdvance::Dispatched
            {
                return true;
            }
        }
    }

    fn release_if_drained(&self, thread_id: &str, run_id: u64) -> bool {
        let mut active = self.lock_active();
        if active.get(thread_id).map(|slot| slot.run_id) != Some(run_id) {
            return true;
        }
        let queue = &self.inner.queue;
        if queue.is_empty(thread_id) || queue.settings(thread_id).paused {
            active.remove(thread_id);
            return true;
        }
        false
    }

    fn attach(&self, thread_id: &str, run_id: u64, execution: Arc<Execution>) -> bool {
        match self.lock_active().get_mut(thread_id) {
            Some(slot) if slot.run_id == run_id => {
                slot.execution = Some(execution);
                true
            }
            _ => false,
        }
    }

    fn owns(&self, thread_id: &str, run_id: u64) -> bool {
        self.lock_active()
            .get(thread_id)
            .map(|slot| slot.run_id == run_id)
            .unwrap_or(false)
    }

    fn is_settled(&self, thread_id: &str) -> bool {
        if self.lock_active().contains_key(thread_id) {
            return false;
        }
        self.inner.queue.is_empty(thread_id) || self.inner.queue.settings(thread_id).paused
    }

    fn active_execution(&self, thread_id: &str) -> Option<Arc<Execution>> {
        self.lock_active()
            .get(thread_id)
            .and_then(|slot| slot.execution.clone())
    }

    fn next_run_id(&self) -> u64 {
        self.inner.next_run_id.fetch_add(1, Ordering::SeqCst)
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, HashMap<String, ActiveSlot>> {
        match self.inner.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

struct Dispatch<'a> {
    relay: &'a Relay,
    run_id: u64,
}

impl PromptRunner for Dispatch<'_> {
    fn run_prompt(&self, thread_id: &str, channel_id: &str, prompt: QueuedPrompt) {
        self.relay
            .spawn_run(thread_id, channel_id, prompt, self.run_id);
    }
}

struct RunCallbacks {
    relay: Relay,
    thread_id: String,
    channel_id: String,
    run_id: u64,
    workspace_path: PathBuf,
    ticker: Arc<TickerGuard>,
}

impl ExecutionCallbacks for RunCallbacks {
    fn on_session_init(&self, session_id: &str) {
        let port = self
            .relay
            .sessions()
            .get_session_for_thread(&self.thread_id)
            .filter(|session| session.session_id == session_id)
            .map(|session| session.port)
            .unwrap_or(0);
        self.relay.sessions().record_session_init(
            &self.thread_id,
            session_id,
            &self.workspace_path,
            port,
        );
    }

    fn on_complete(&self, result: ExecutionResult) {
        self.ticker.clear();
        info!(
            thread_id = %self.thread_id,
            chars = result.text.chars().count(),
            "execution complete"
        );
        self.relay
            .inner
            .notifier
            .completed(&self.thread_id, &result.text, &done_summary(&result));
        self.relay.finish(
            &self.thread_id,
            &self.channel_id,
            self.run_id,
            ExecutionOutcome::Completed,
        );
    }

    fn on_error(&self, error: RelayError) {
        self.ticker.clear();
        warn!(
            thread_id = %self.thread_id,
            error_type = error.error_type().as_urn(),
            error = %error,
            "execution failed"
        );
        self.relay
            .inner
            .notifier
            .failed(&self.thread_id, &failure_message(&error));
        self.relay.finish(
            &self.thread_id,
            &self.channel_id,
            self.run_id,
            ExecutionOutcome::Failed,
        );
    }
}

/// Holds the progress ticker of one run; cleared exactly once.
#[derive(Default)]
struct TickerGuard {
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TickerGuard {
    fn set(&self, handle: JoinHandle<()>) {
        if let Some(previous) = self.lock().replace(handle) {
            previous.abort();
        }
    }

    fn clear(&self) -> bool {
        match self.lock().take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        match self.handle.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for TickerGuard {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Backend verdicts are shown as-is; setup failures get a prefix.
fn failure_message(err: &RelayError) -> String {
    if err.error_type().is_terminal_backend_error() {
        err.to_string()
    } else {
        format!("Execution failed: {err}")
    }
}

fn describe(prompt: &str) -> String {
    let mut description = prompt.chars().take(50).collect::<String>();
    if prompt.chars().count() > 50 {
        description.push_str("...");
    }
    description
}
