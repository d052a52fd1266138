use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use agent_relay_error::RelayError;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use super::accumulator::{apply_line, end_of_stream, LineOutcome};
use super::{lock, ExecutionCallbacks, ExecutionRequest, ExecutionState, Lifecycle};
use crate::session::SessionRegistry;

struct RunningQuery {
    #[cfg_attr(not(unix), allow(dead_code))]
    pid: Option<u32>,
    #[cfg_attr(unix, allow(dead_code))]
    cancel: Arc<Notify>,
}

/// One agent CLI process streaming `stream-json` messages on stdout.
pub struct LocalExecution {
    program: PathBuf,
    sessions: SessionRegistry,
    state: ExecutionState,
    running: Mutex<Option<RunningQuery>>,
}

impl LocalExecution {
    pub fn new(program: PathBuf, sessions: SessionRegistry) -> Self {
        Self {
            program,
            sessions,
            state: ExecutionState::default(),
            running: Mutex::new(None),
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
        let resume = self
            .sessions
            .resume_candidate(&request.thread_id, &request.workspace_path);
        let args = query_args(&request.prompt, request.model.as_deref(), resume.as_deref());

        let mut child = Command::new(&self.program)
            .args(&args)
            .current_dir(&request.workspace_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| RelayError::WorkerSpawn {
                program: self.program.display().to_string(),
                message: err.to_string(),
            })?;

        let stdout = child.stdout.take().ok_or_else(|| RelayError::WorkerSpawn {
            program: self.program.display().to_string(),
            message: "missing stdout".to_string(),
        })?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(line = %line, "agent stderr");
                }
            });
        }

        let cancel = Arc::new(Notify::new());
        *lock(&self.running) = Some(RunningQuery {
            pid: child.id(),
            cancel: cancel.clone(),
        });

        info!(
            thread_id = %request.thread_id,
            path = %request.workspace_path.display(),
            resume = resume.as_deref().unwrap_or(""),
            "agent query started"
        );

        let lifecycle = Lifecycle::new(self.state.clone(), callbacks);
        tokio::spawn(consume(child, stdout, self.state.clone(), lifecycle, cancel));
        Ok(())
    }

    pub fn interrupt(&self) -> bool {
        if self.state.is_completed() {
            return false;
        }
        let guard = lock(&self.running);
        let Some(running) = guard.as_ref() else {
            return false;
        };
        send_interrupt(running)
    }
}

#[cfg(unix)]
fn send_interrupt(running: &RunningQuery) -> bool {
    match running.pid {
        Some(pid) => unsafe { libc::kill(pid as i32, libc::SIGINT) == 0 },
        None => false,
    }
}

#[cfg(not(unix))]
fn send_interrupt(running: &RunningQuery) -> bool {
    running.cancel.notify_one();
    true
}

fn query_args(prompt: &str, model: Option<&str>, resume: Option<&str>) -> Vec<String> {
    let mut args = vec![
        "-p".to_string(),
        prompt.to_string(),
        "--output-format".to_string(),
        "stream-json".to_string(),
        "--verbose".to_string(),
        "--include-partial-messages".to_string(),
        "--permission-mode".to_string(),
        "bypassPermissions".to_string(),
    ];
    if let Some(model) = model.filter(|model| !model.trim().is_empty()) {
        args.push("--model".to_string());
        args.push(model.to_string());
    }
    if let Some(session_id) = resume {
        args.push("--resume".to_string());
        args.push(session_id.to_string());
    }
    args
}

async fn consume(
    mut child: Child,
    stdout: ChildStdout,
    state: ExecutionState,
    lifecycle: Lifecycle,
    cancel: Arc<Notify>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let next = tokio::select! {
            line = lines.next_line() => line,
            _ = cancel.notified() => {
                let _ = child.start_kill();
                continue;
            }
        };

        match next {
            Ok(Some(line)) => match apply_line(&state, &line) {
                LineOutcome::Continue => {}
                LineOutcome::SessionInit(session_id) => lifecycle.session_init(&session_id),
                LineOutcome::Complete(result) => {
                    lifecycle.complete(result);
                    break;
                }
                LineOutcome::Failed(message) => {
                    lifecycle.fail(RelayError::execution_failed(message));
                    break;
                }
            },
            Ok(None) => {
                lifecycle.complete(end_of_stream(&state));
                break;
            }
            Err(err) => {
                lifecycle.fail(RelayError::execution_failed(format!(
                    "failed to read agent output: {err}"
                )));
                break;
            }
        }
    }

    drop(lines);
    match child.wait().await {
        Ok(status) if status.success() => debug!("agent query exited"),
        Ok(status) => warn!(status = %status, "agent query exited with failure status"),
        Err(err) => warn!(error = %err, "failed to reap agent query"),
    }
}
