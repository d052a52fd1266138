//! Hooks through which the relay reports thread activity to a user interface.
//! Only plain strings cross this boundary; rendering belongs to the host.

use tracing::{error, info, warn};

use crate::execution::ExecutionResult;

pub const SPINNER_FRAMES: [&str; 10] = ["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];
pub const QUEUE_CLEARED_NOTICE: &str = "❌ Execution failed. Queue cleared.";
pub const PROCESSING_PLACEHOLDER: &str = "Processing...";

pub trait ThreadNotifier: Send + Sync {
    fn started(&self, thread_id: &str, header: &str, prompt: &str);
    fn progress(&self, thread_id: &str, frame: &str, text: &str);
    fn completed(&self, thread_id: &str, text: &str, summary: &str);
    fn failed(&self, thread_id: &str, message: &str);
    fn notice(&self, thread_id: &str, message: &str);
}

/// Writes every event to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl ThreadNotifier for LogNotifier {
    fn started(&self, thread_id: &str, header: &str, prompt: &str) {
        info!(thread_id, header, prompt, "execution started");
    }

    fn progress(&self, thread_id: &str, frame: &str, text: &str) {
        info!(thread_id, frame, chars = text.chars().count(), "execution running");
    }

    fn completed(&self, thread_id: &str, text: &str, summary: &str) {
        info!(thread_id, summary, text, "execution completed");
    }

    fn failed(&self, thread_id: &str, message: &str) {
        error!(thread_id, message, "execution failed");
    }

    fn notice(&self, thread_id: &str, message: &str) {
        warn!(thread_id, message, "thread notice");
    }
}

pub fn context_header(branch: &str, model: &str) -> String {
    format!("🌿 {branch} | 🤖 {model}")
}

/// `✅ Done`, plus cost when positive and turn count when reported.
pub fn done_summary(result: &ExecutionResult) -> String {
    let mut summary = "✅ Done".to_string();
    if let Some(cost) = result.cost.filter(|cost| *cost > 0.0) {
        summary.push_str(&format!(" | 💰 ${cost:.4}"));
    }
    if let Some(turns) = result.num_turns {
        summary.push_str(&format!(" | 🔄 {turns} turns"));
    }
    summary
}

pub fn spinner_frame(tick: u64) -> &'static str {
    SPINNER_FRAMES[(tick % SPINNER_FRAMES.len() as u64) as usize]
}
