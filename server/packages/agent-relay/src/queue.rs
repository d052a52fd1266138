//! Per-thread FIFO of pending prompts and the run policy applied when an
//! execution finishes.

use std::sync::Arc;

use tracing::{debug, info};

use crate::store::{QueueSettings, QueuedPrompt, RelayStore};

/// Starts a popped prompt. The relay implements this.
pub trait PromptRunner {
    fn run_prompt(&self, thread_id: &str, channel_id: &str, prompt: QueuedPrompt);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueAdvance {
    Dispatched,
    Idle,
    Paused,
    /// Failure with `continue_on_failure` unset; the queue was emptied.
    Halted { discarded: usize },
}

#[derive(Clone)]
pub struct ThreadQueue {
    store: Arc<dyn RelayStore>,
}

impl ThreadQueue {
    pub fn new(store: Arc<dyn RelayStore>) -> Self {
        Self { store }
    }

    /// Appends a prompt and returns its 1-based position.
    pub fn enqueue(&self, thread_id: &str, prompt: QueuedPrompt) -> usize {
        let position = self.store.push_queue(thread_id, prompt);
        debug!(thread_id, position, "prompt queued");
        position
    }

    pub fn len(&self, thread_id: &str) -> usize {
        self.store.queue(thread_id).len()
    }

    pub fn is_empty(&self, thread_id: &str) -> bool {
        self.len(thread_id) == 0
    }

    pub fn list(&self, thread_id: &str) -> Vec<QueuedPrompt> {
        self.store.queue(thread_id)
    }

    pub fn clear(&self, thread_id: &str) -> usize {
        self.store.clear_queue(thread_id)
    }

    pub fn settings(&self, thread_id: &str) -> QueueSettings {
        self.store.queue_settings(thread_id)
    }

    pub fn update_settings(
        &self,
        thread_id: &str,
        update: impl FnOnce(&mut QueueSettings),
    ) -> QueueSettings {
        let mut settings = self.store.queue_settings(thread_id);
        update(&mut settings);
        self.store.set_queue_settings(thread_id, settings);
        settings
    }

    /// Pops at most one prompt and hands it to `runner`.
    pub fn process_next(
        &self,
        thread_id: &str,
        channel_id: &str,
        runner: &dyn PromptRunner,
    ) -> QueueAdvance {
        if self.store.queue_settings(thread_id).paused {
            return QueueAdvance::Paused;
        }
        match self.store.pop_queue(thread_id) {
            Some(prompt) => {
                debug!(thread_id, requester = %prompt.requester_id, "dispatching queued prompt");
                runner.run_prompt(thread_id, channel_id, prompt);
                QueueAdvance::Dispatched
            }
            None => QueueAdvance::Idle,
        }
    }

    /// Applies the run policy after an execution reached a terminal state.
    pub fn advance(
        &self,
        thread_id: &str,
        channel_id: &str,
        outcome: ExecutionOutcome,
        runner: &dyn PromptRunner,
    ) -> QueueAdvance {
        if outcome == ExecutionOutcome::Failed
            && !self.store.queue_settings(thread_id).continue_on_failure
        {
            let discarded = self.store.clear_queue(thread_id);
            info!(thread_id, discarded, "execution failed; queue cleared");
            return QueueAdvance::Halted { discarded };
        }
        self.process_next(thread_id, channel_id, runner)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::store::MemoryStore;

    #[derive(Default)]
    struct RecordingRunner {
        started: Mutex<Vec<String>>,
    }

    impl PromptRunner for RecordingRunner {
        fn run_prompt(&self, _thread_id: &str, _channel_id: &str, prompt: QueuedPrompt) {
            self.started.lock().unwrap().push(prompt.prompt);
        }
    }

    fn queue_with(prompts: &[&str]) -> ThreadQueue {
        let queue = ThreadQueue::new(Arc::new(MemoryStore::new()));
        for prompt in prompts {
            queue.enqueue("t1", QueuedPrompt::new(*prompt, "u1"));
        }
        queue
    }

    #[test]
    fn paused_queue_never_pops() {
        let queue = queue_with(&["a", "b"]);
        queue.update_settings("t1", |settings| settings.paused = true);
        let runner = RecordingRunner::default();

        assert_eq!(queue.process_next("t1", "c1", &runner), QueueAdvance::Paused);
        assert_eq!(queue.len("t1"), 2);
        assert!(runner.started.lock().unwrap().is_empty());
    }

    #[test]
    fn empty_queue_is_idle() {
        let queue = queue_with(&[]);
        let runner = RecordingRunner::default();
        assert_eq!(queue.process_next("t1", "c1", &runner), QueueAdvance::Idle);
        assert!(runner.started.lock().unwrap().is_empty());
    }

    #[test]
    fn each_call_dispatches_exactly_one_in_order() {
        let queue = queue_with(&["a", "b", "c"]);
        let runner = RecordingRunner::default();

        assert_eq!(queue.process_next("t1", "c1", &runner), QueueAdvance::Dispatched);
        assert_eq!(*runner.started.lock().unwrap(), vec!["a".to_string()]);
        assert_eq!(queue.len("t1"), 2);

        assert_eq!(queue.process_next("t1", "c1", &runner), QueueAdvance::Dispatched);
        assert_eq!(
            *runner.started.lock().unwrap(),
            vec!["a".to_string(), "b".to_string()]
        );
    }

    #[test]
    fn failure_without_continue_clears_queue() {
        let queue = queue_with(&["a", "b"]);
        let runner = RecordingRunner::default();

        let advance = queue.advance("t1", "c1", ExecutionOutcome::Failed, &runner);
        assert_eq!(advance, QueueAdvance::Halted { discarded: 2 });
        assert!(queue.is_empty("t1"));
        assert!(runner.started.lock().unwrap().is_empty());
    }

    #[test]
    fn failure_with_continue_dispatches_next() {
        let queue = queue_with(&["a", "b"]);
        queue.update_settings("t1", |settings| settings.continue_on_failure = true);
        let runner = RecordingRunner::default();

        let advance = queue.advance("t1", "c1", ExecutionOutcome::Failed, &runner);
        assert_eq!(advance, QueueAdvance::Dispatched);
        assert_eq!(*runner.started.lock().unwrap(), vec!["a".to_string()]);
        assert_eq!(queue.len("t1"), 1);
    }

    #[test]
    fn success_always_advances() {
        let queue = queue_with(&["a"]);
        let runner = RecordingRunner::default();
        assert_eq!(
            queue.advance("t1", "c1", ExecutionOutcome::Completed, &runner),
            QueueAdvance::Dispatched
        );
        assert_eq!(
            queue.advance("t1", "c1", ExecutionOutcome::Completed, &runner),
            QueueAdvance::Idle
        );
    }
}
