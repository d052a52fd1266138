//! Version-control helpers the relay uses to pick an execution directory.

use std::path::{Path, PathBuf};
use std::process::Command;

use agent_relay_error::RelayError;
use futures::future::BoxFuture;
use futures::FutureExt;

const WORKTREE_DIR: &str = ".agent-relay/worktrees";

pub trait WorkspaceProvider: Send + Sync {
    /// Creates a worktree on a new `branch` and returns its directory.
    fn create_worktree<'a>(
        &'a self,
        project_path: &'a Path,
        branch: &'a str,
    ) -> BoxFuture<'a, Result<PathBuf, RelayError>>;

    fn current_branch<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Option<String>>;

    fn worktree_exists(&self, path: &Path) -> bool;

    fn remove_worktree<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<(), RelayError>>;
}

/// [`WorkspaceProvider`] backed by the `git` CLI.
#[derive(Debug, Clone, Copy, Default)]
pub struct GitWorkspace;

impl WorkspaceProvider for GitWorkspace {
    fn create_worktree<'a>(
        &'a self,
        project_path: &'a Path,
        branch: &'a str,
    ) -> BoxFuture<'a, Result<PathBuf, RelayError>> {
        async move {
            let branch = sanitize_branch_name(branch);
            if branch.is_empty() {
                return Err(RelayError::Workspace {
                    message: "branch name is required".to_string(),
                });
            }

            let base_dir = project_path.join(WORKTREE_DIR);
            let worktree_dir = base_dir.join(branch.replace('/', "-"));
            if worktree_dir.exists() {
                return Err(RelayError::Workspace {
                    message: format!(
                        "worktree directory already exists: {}",
                        worktree_dir.display()
                    ),
                });
            }
            tokio::fs::create_dir_all(&base_dir)
                .await
                .map_err(|err| RelayError::Workspace {
                    message: format!("failed to create worktree directory: {err}"),
                })?;

            run_git_command(
                project_path,
                &[
                    "worktree".to_string(),
                    "add".to_string(),
                    "-b".to_string(),
                    branch,
                    worktree_dir.to_string_lossy().to_string(),
                ],
            )
            .await?;
            Ok(worktree_dir)
        }
        .boxed()
    }

    fn current_branch<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Option<String>> {
        async move {
            let output = run_git_command(
                path,
                &[
                    "rev-parse".to_string(),
                    "--abbrev-ref".to_string(),
                    "HEAD".to_string(),
                ],
            )
            .await
            .ok()?;
            let trimmed = output.trim();
            if trimmed.is_empty() || trimmed == "HEAD" {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        .boxed()
    }

    fn worktree_exists(&self, path: &Path) -> bool {
        path.join(".git").exists()
    }

    fn remove_worktree<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<(), RelayError>> {
        async move {
            if !path.exists() {
                return Err(RelayError::Workspace {
                    message: format!("worktree directory does not exist: {}", path.display()),
                });
            }
            run_git_command(
                path,
                &[
                    "worktree".to_string(),
                    "remove".to_string(),
                    "--force".to_string(),
                    path.to_string_lossy().to_string(),
                ],
            )
            .await
            .map(|_| ())
        }
        .boxed()
    }
}

/// Keeps characters git accepts in a ref name; whitespace becomes `-`.
pub fn sanitize_branch_name(name: &str) -> String {
    let mut sanitized = String::new();
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '/' | '.') {
            sanitized.push(ch);
        } else if ch.is_ascii_whitespace() {
            sanitized.push('-');
        }
    }
    while sanitized.contains("--") {
        sanitized = sanitized.replace("--", "-");
    }
    while sanitized.contains("..") {
        sanitized = sanitized.replace("..", ".");
    }
    sanitized
        .trim_matches(|ch| matches!(ch, '-' | '/' | '.'))
        .to_string()
}

async fn run_git_command(directory: &Path, args: &[String]) -> Result<String, RelayError> {
    let directory = directory.to_path_buf();
    let args = args.to_vec();
    let output = tokio::task::spawn_blocking(move || {
        Command::new("git").args(&args).current_dir(directory).output()
    })
    .await
    .map_err(|err| RelayError::Workspace {
        message: format!("git command failed: {err}"),
    })
    .and_then(|result| {
        result.map_err(|err| RelayError::Workspace {
            message: format!("git command failed: {err}"),
        })
    })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(RelayError::Workspace {
            message: if stderr.is_empty() {
                "git command failed".to_string()
            } else {
                stderr
            },
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
