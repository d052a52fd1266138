#![cfg(unix)]

mod common;

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use agent_relay::store::{MemoryStore, RelayStore};
use agent_relay::{BackendKind, Relay, RelaySettings, WorkerRegistry};
use common::{project_store, DirWorkspace, Note, RecordingNotifier, CHANNEL};
use tempfile::TempDir;

const THREAD: &str = "thread-local-1";

const SUCCESS_SCRIPT: &str = r#"#!/bin/sh
printf '%s\n' "$@" > args.txt
echo '{"type":"system","subtype":"init","session_id":"local-1"}'
echo 'not json at all'
echo '{"type":"stream_event","event":{"type":"content_block_delta","delta":{"type":"text_delta","text":"Hel"}}}'
echo '{"type":"stream_event","event":{"type":"content_block_delta","delta":{"type":"text_delta","text":"lo"}}}'
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"Hello"}]}}'
echo '{"type":"result","subtype":"success","result":"Hello","total_cost_usd":0.0123,"duration_ms":10,"num_turns":2}'
"#;

const FAILING_SCRIPT: &str = r#"#!/bin/sh
echo '{"type":"system","subtype":"init","session_id":"local-2"}'
echo '{"type":"result","subtype":"error_max_turns"}'
"#;

const SILENT_SCRIPT: &str = "#!/bin/sh\nexit 3\n";

fn write_agent(dir: &TempDir, script: &str) -> PathBuf {
    let path = dir.path().join("fake-agent");
    std::fs::write(&path, script).expect("write agent script");
    let mut permissions = std::fs::metadata(&path).expect("metadata").permissions();
    permissions.set_mode(0o755);
    std::fs::set_permissions(&path, permissions).expect("chmod");
    path
}

struct Harness {
    relay: Relay,
    store: Arc<MemoryStore>,
    notifier: Arc<RecordingNotifier>,
    workspace: Arc<DirWorkspace>,
    project: TempDir,
    _bin: TempDir,
}

impl Harness {
    fn new(script: &str, auto_worktree: bool, model: Option<&str>) -> Self {
        let bin = TempDir::new().expect("bin dir");
        let project = TempDir::new().expect("project dir");
        let store = project_store(project.path(), auto_worktree, model);
        let notifier = Arc::new(RecordingNotifier::default());
        let workspace = Arc::new(DirWorkspace::default());
        let relay = Relay::new(
            store.clone(),
            WorkerRegistry::default(),
            workspace.clone(),
            notifier.clone(),
            RelaySettings {
                backend: BackendKind::Local,
                query_program: write_agent(&bin, script),
                progress_interval: Duration::from_millis(20),
                ..RelaySettings::default()
            },
        );
        Self {
            relay,
            store,
            notifier,
            workspace,
            project,
            _bin: bin,
        }
    }

    async fn run(&self, prompt: &str) {
        self.relay.submit(THREAD, CHANNEL, prompt, "u1");
        tokio::time::timeout(Duration::from_secs(10), self.relay.wait_idle(THREAD))
            .await
            .expect("thread settles");
    }
}

fn recorded_args(dir: &Path) -> Vec<String> {
    std::fs::read_to_string(dir.join("args.txt"))
        .expect("agent wrote its arguments")
        .lines()
        .map(str::to_string)
        .collect()
}

#[tokio::test]
async fn streamed_result_completes_with_cost_and_turns() {
    let harness = Harness::new(SUCCESS_SCRIPT, false, None);
    harness.run("say hello").await;

    assert_eq!(
        harness.notifier.notes().last(),
        Some(&Note::Completed {
            text: "Hello".to_string(),
            summary: "✅ Done | 💰 $0.0123 | 🔄 2 turns".to_string(),
        })
    );

    let session = harness.store.thread_session(THREAD).expect("session recorded");
    assert_eq!(session.session_id, "local-1");
    assert_eq!(session.project_path, harness.project.path());

    let args = recorded_args(harness.project.path());
    assert_eq!(args[0], "-p");
    assert_eq!(args[1], "say hello");
    assert!(!args.contains(&"--resume".to_string()));
}

#[tokio::test]
async fn follow_up_resumes_and_passes_the_channel_model() {
    let harness = Harness::new(SUCCESS_SCRIPT, false, Some("opus"));
    harness.run("first").await;
    harness.run("second").await;

    let args = recorded_args(harness.project.path());
    assert!(args.windows(2).any(|pair| pair == ["--model", "opus"]));
    assert!(args.windows(2).any(|pair| pair == ["--resume", "local-1"]));
    assert_eq!(harness.notifier.completed_texts(), vec!["Hello", "Hello"]);

    match &harness.notifier.notes()[0] {
        Note::Started { header, .. } => assert_eq!(header, "🌿 trunk | 🤖 opus"),
        other => panic!("unexpected first note {other:?}"),
    }
}

#[tokio::test]
async fn fresh_context_skips_resume() {
    let harness = Harness::new(SUCCESS_SCRIPT, false, None);
    harness.run("first").await;
    harness
        .relay
        .queue()
        .update_settings(THREAD, |settings| settings.fresh_context = true);
    harness.run("second").await;

    let args = recorded_args(harness.project.path());
    assert!(!args.contains(&"--resume".to_string()));
}

#[tokio::test]
async fn error_result_fails_with_its_subtype() {
    let harness = Harness::new(FAILING_SCRIPT, false, None);
    harness.run("do something").await;

    assert_eq!(
        harness.notifier.failures(),
        vec!["Query failed with subtype: error_max_turns"]
    );
    assert_eq!(
        harness
            .store
            .thread_session(THREAD)
            .map(|session| session.session_id),
        Some("local-2".to_string())
    );
}

#[tokio::test]
async fn silent_exit_completes_with_placeholder_text() {
    let harness = Harness::new(SILENT_SCRIPT, false, None);
    harness.run("anything").await;

    assert_eq!(
        harness.notifier.completed_texts(),
        vec!["No output received."]
    );
}

#[tokio::test]
async fn missing_agent_program_is_a_setup_failure() {
    let harness = Harness::new(SUCCESS_SCRIPT, false, None);
    let relay = Relay::new(
        harness.store.clone(),
        WorkerRegistry::default(),
        harness.workspace.clone(),
        harness.notifier.clone(),
        RelaySettings {
            backend: BackendKind::Local,
            query_program: PathBuf::from("/nonexistent/agent-cli"),
            ..RelaySettings::default()
        },
    );

    relay.submit(THREAD, CHANNEL, "hello", "u1");
    tokio::time::timeout(Duration::from_secs(10), relay.wait_idle(THREAD))
        .await
        .expect("thread settles");

    let failures = harness.notifier.failures();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].contains("failed to spawn worker"), "{}", failures[0]);
}

#[tokio::test]
async fn auto_worktree_is_created_reused_and_discarded() {
    let harness = Harness::new(SUCCESS_SCRIPT, true, None);
    harness.run("build the feature").await;

    let mapping = harness.store.worktree_mapping(THREAD).expect("mapping stored");
    assert!(mapping.branch_name.starts_with("auto/thread-l"));
    assert_eq!(mapping.project_path, harness.project.path());
    assert_eq!(mapping.description, "build the feature");
    assert!(recorded_args(&mapping.worktree_path).contains(&"build the feature".to_string()));
    assert!(harness
        .notifier
        .notes()
        .contains(&Note::Notice(format!("🌳 Auto-worktree: {}", mapping.branch_name))));

    let session = harness.store.thread_session(THREAD).expect("session");
    assert_eq!(session.project_path, mapping.worktree_path);

    harness.run("keep going").await;
    assert_eq!(harness.workspace.created.lock().unwrap().len(), 1);
    let args = recorded_args(&mapping.worktree_path);
    assert!(args.windows(2).any(|pair| pair == ["--resume", "local-1"]));

    assert!(harness.relay.discard_worktree(THREAD).await.expect("discard"));
    assert!(harness.store.worktree_mapping(THREAD).is_none());
    assert!(harness.store.thread_session(THREAD).is_none());
    assert_eq!(
        harness.workspace.removed.lock().unwrap().as_slice(),
        &[mapping.worktree_path.clone()]
    );
    assert!(!harness.relay.discard_worktree(THREAD).await.expect("discard"));
}

#[tokio::test]
async fn vanished_worktree_falls_back_to_a_new_one() {
    let harness = Harness::new(SUCCESS_SCRIPT, true, None);
    harness.run("first").await;
    let first = harness.store.worktree_mapping(THREAD).expect("mapping");
    std::fs::remove_dir_all(&first.worktree_path).expect("remove worktree");

    tokio::time::sleep(Duration::from_millis(5)).await;
    harness.run("second").await;
    let second = harness.store.worktree_mapping(THREAD).expect("mapping");
    assert_ne!(second.worktree_path, first.worktree_path);
    assert_eq!(harness.workspace.created.lock().unwrap().len(), 2);

    let args = recorded_args(&second.worktree_path);
    assert!(!args.contains(&"--resume".to_string()));
}
