//! Fair-share command queue.
//!
//! Every SSH exec channel in the process is opened through this queue. The
//! queue bounds concurrency (default 3 channels) so a burst of commands
//! cannot trip the remote sshd into `CHANNEL_OPEN_FAILURE`, and inserts a
//! small delay (default 300 ms) between the completion of one command and
//! the start of the next in the freed slot.
//!
//! Ordering is FIFO across all sessions. The pending list is bounded;
//! overflow completes the entry's callback with a rejection error instead
//! of growing without limit. Callbacks fire exactly once: on completion,
//! failure, rejection, or when the entry is cleared with its session.
//!
//! Actual execution lives behind [`ExecRunner`], so scheduling is testable
//! without a live SSH connection.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::gateway::config::{
    DEFAULT_COMMAND_DELAY_MS, DEFAULT_MAX_CONCURRENT_COMMANDS, DEFAULT_QUEUE_MAX_PENDING,
};
use crate::gateway::transport::EventSink;

/// Tunables for the command queue.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// Maximum concurrently running exec channels across the process.
    pub max_concurrent: usize,
    /// Delay between a command completing and the freed slot starting the
    /// next one.
    pub inter_command_delay: Duration,
    /// Bound on the pending list; overflow is rejected via the callback.
    pub max_pending: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT_COMMANDS,
            inter_command_delay: Duration::from_millis(DEFAULT_COMMAND_DELAY_MS),
            max_pending: DEFAULT_QUEUE_MAX_PENDING,
        }
    }
}

/// What a queued command should run and where partial output goes.
#[derive(Clone)]
pub struct CommandSpec {
    pub session_id: String,
    pub command: String,
    /// Background commands never reach the terminal; their results are
    /// returned programmatically.
    pub background: bool,
    /// Stream stdout chunks to the sink as they arrive (foreground only).
    pub stream_partial: bool,
    pub execution_id: Option<String>,
    pub sink: Option<Arc<dyn EventSink>>,
}

impl CommandSpec {
    /// A background command: output returned programmatically only.
    pub fn background(session_id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            command: command.into(),
            background: true,
            stream_partial: false,
            execution_id: None,
            sink: None,
        }
    }

    /// A foreground command with default flags.
    pub fn foreground(session_id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            command: command.into(),
            background: false,
            stream_partial: false,
            execution_id: None,
            sink: None,
        }
    }
}

/// Result of a queued command, delivered to the callback exactly once.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    /// Present when the command failed, was rejected, or exited non-zero.
    pub error: Option<String>,
    pub output: String,
    pub error_output: String,
    pub exit_code: Option<i32>,
    pub background: bool,
}

impl CommandOutcome {
    /// An outcome representing a failure before any output was produced.
    pub fn failed(message: impl Into<String>, background: bool) -> Self {
        Self {
            error: Some(message.into()),
            output: String::new(),
            error_output: String::new(),
            exit_code: None,
            background,
        }
    }
}

/// Executes a single queued command.
///
/// The production implementation opens an SSH exec channel on the session's
/// connection; tests substitute a fake to observe scheduling.
#[async_trait]
pub trait ExecRunner: Send + Sync {
    async fn run(&self, spec: &CommandSpec) -> CommandOutcome;
}

/// Queue counters observed atomically, reported by the health endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueState {
    pub pending: usize,
    pub running: usize,
}

struct QueuedCommand {
    spec: CommandSpec,
    responder: oneshot::Sender<CommandOutcome>,
}

struct Inner {
    pending: VecDeque<QueuedCommand>,
    running: usize,
}

struct QueueCore {
    settings: QueueSettings,
    runner: Arc<dyn ExecRunner>,
    inner: StdMutex<Inner>,
}

/// Process-wide scheduler for SSH exec channels. Cheap to clone; all
/// clones share the same queue.
#[derive(Clone)]
pub struct CommandQueue {
    core: Arc<QueueCore>,
}

impl CommandQueue {
    pub fn new(settings: QueueSettings, runner: Arc<dyn ExecRunner>) -> Self {
        Self {
            core: Arc::new(QueueCore {
                settings,
                runner,
                inner: StdMutex::new(Inner {
                    pending: VecDeque::new(),
                    running: 0,
                }),
            }),
        }
    }

    /// Append a command to the queue and trigger dispatch. Never blocks.
    ///
    /// When the pending list is full the responder is completed immediately
    /// with a rejection error.
    pub fn enqueue(&self, spec: CommandSpec, responder: oneshot::Sender<CommandOutcome>) {
        let rejected = {
            let mut inner = self.core.inner.lock().expect("queue lock poisoned");
            if inner.pending.len() >= self.core.settings.max_pending {
                Some((spec, responder))
            } else {
                inner.pending.push_back(QueuedCommand { spec, responder });
                None
            }
        };

        match rejected {
            Some((spec, responder)) => {
                warn!(
                    "Command queue is full ({} pending), rejecting '{}'",
                    self.core.settings.max_pending, spec.command
                );
                let _ = responder.send(CommandOutcome::failed(
                    format!(
                        "Command queue is full ({} pending)",
                        self.core.settings.max_pending
                    ),
                    spec.background,
                ));
            }
            None => dispatch(&self.core),
        }
    }

    /// Enqueue and wait for the outcome. The callback contract still holds:
    /// the internal responder fires exactly once.
    pub async fn submit(&self, spec: CommandSpec) -> CommandOutcome {
        let background = spec.background;
        let (tx, rx) = oneshot::channel();
        self.enqueue(spec, tx);
        rx.await.unwrap_or_else(|_| {
            CommandOutcome::failed("Command was dropped by the queue", background)
        })
    }

    /// Remove all pending entries for a session, preserving the relative
    /// order of everything else. Running entries are untouched: they own a
    /// live channel and cancelling them would leak server-side state.
    pub fn clear_session(&self, session_id: &str) {
        let removed: Vec<QueuedCommand> = {
            let mut inner = self.core.inner.lock().expect("queue lock poisoned");
            let kept = VecDeque::with_capacity(inner.pending.len());
            let drained = std::mem::replace(&mut inner.pending, kept);
            let mut removed = Vec::new();
            for entry in drained {
                if entry.spec.session_id == session_id {
                    removed.push(entry);
                } else {
                    inner.pending.push_back(entry);
                }
            }
            removed
        };

        if !removed.is_empty() {
            debug!(
                "Cleared {} pending command(s) for session {}",
                removed.len(),
                session_id
            );
        }
        for entry in removed {
            let background = entry.spec.background;
            let _ = entry
                .responder
                .send(CommandOutcome::failed("Session closed", background));
        }
    }

    /// Snapshot of pending and running counts, observed atomically.
    pub fn state(&self) -> QueueState {
        let inner = self.core.inner.lock().expect("queue lock poisoned");
        QueueState {
            pending: inner.pending.len(),
            running: inner.running,
        }
    }
}

/// Start as many pending entries as free slots allow.
fn dispatch(core: &Arc<QueueCore>) {
    loop {
        let entry = {
            let mut inner = core.inner.lock().expect("queue lock poisoned");
            if inner.running < core.settings.max_concurrent && !inner.pending.is_empty() {
                inner.running += 1;
                inner.pending.pop_front()
            } else {
                None
            }
        };

        match entry {
            Some(entry) => {
                let core = Arc::clone(core);
                tokio::spawn(run_entry(core, entry));
            }
            None => break,
        }
    }
}

async fn run_entry(core: Arc<QueueCore>, entry: QueuedCommand) {
    let outcome = core.runner.run(&entry.spec).await;
    // Callback fires before the inter-command delay so completion order is
    // observable ahead of slot reuse.
    let _ = entry.responder.send(outcome);

    tokio::time::sleep(core.settings.inter_command_delay).await;
    {
        let mut inner = core.inner.lock().expect("queue lock poisoned");
        inner.running = inner.running.saturating_sub(1);
    }
    dispatch(&core);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;
    use tokio::sync::Semaphore;

    /// Runner that records scheduling without any SSH involved.
    struct FakeRunner {
        active: AtomicUsize,
        max_active: AtomicUsize,
        started: StdMutex<Vec<String>>,
        completed: StdMutex<Vec<String>>,
        delay: Duration,
        /// When set, each run must acquire a permit before finishing.
        gate: Option<Arc<Semaphore>>,
    }

    impl FakeRunner {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
                started: StdMutex::new(Vec::new()),
                completed: StdMutex::new(Vec::new()),
                delay,
                gate: None,
            })
        }

        fn gated(gate: Arc<Semaphore>) -> Arc<Self> {
            Arc::new(Self {
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
                started: StdMutex::new(Vec::new()),
                completed: StdMutex::new(Vec::new()),
                delay: Duration::from_millis(1),
                gate: Some(gate),
            })
        }

        fn started(&self) -> Vec<String> {
            self.started.lock().unwrap().clone()
        }

        fn completed(&self) -> Vec<String> {
            self.completed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ExecRunner for FakeRunner {
        async fn run(&self, spec: &CommandSpec) -> CommandOutcome {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            self.started.lock().unwrap().push(spec.command.clone());

            if let Some(gate) = &self.gate {
                let permit = gate.acquire().await.unwrap();
                permit.forget();
            }
            tokio::time::sleep(self.delay).await;

            self.active.fetch_sub(1, Ordering::SeqCst);
            self.completed.lock().unwrap().push(spec.command.clone());
            CommandOutcome {
                error: None,
                output: format!("ran {}", spec.command),
                error_output: String::new(),
                exit_code: Some(0),
                background: spec.background,
            }
        }
    }

    fn settings(max_concurrent: usize, delay_ms: u64, max_pending: usize) -> QueueSettings {
        QueueSettings {
            max_concurrent,
            inter_command_delay: Duration::from_millis(delay_ms),
            max_pending,
        }
    }

    #[tokio::test]
    async fn test_concurrency_never_exceeds_cap() {
        let runner = FakeRunner::new(Duration::from_millis(10));
        let queue = CommandQueue::new(settings(3, 5, 256), runner.clone());

        let submissions: Vec<_> = (0..10)
            .map(|i| {
                let queue = queue.clone();
                async move {
                    queue
                        .submit(CommandSpec::background("s1", format!("cmd-{}", i)))
                        .await
                }
            })
            .collect();
        let outcomes = futures::future::join_all(submissions).await;

        assert_eq!(outcomes.len(), 10);
        assert!(outcomes.iter().all(|o| o.error.is_none()));
        assert!(runner.max_active.load(Ordering::SeqCst) <= 3);
        assert_eq!(runner.completed().len(), 10);
    }

    #[tokio::test]
    async fn test_fifo_with_single_slot() {
        let runner = FakeRunner::new(Duration::from_millis(3));
        let queue = CommandQueue::new(settings(1, 1, 256), runner.clone());

        let mut receivers = Vec::new();
        for i in 0..5 {
            let (tx, rx) = oneshot::channel();
            queue.enqueue(CommandSpec::background("s1", format!("cmd-{}", i)), tx);
            receivers.push(rx);
        }
        for rx in receivers {
            rx.await.unwrap();
        }

        let expected: Vec<String> = (0..5).map(|i| format!("cmd-{}", i)).collect();
        assert_eq!(runner.started(), expected);
        // With one slot a command completes before the next one starts.
        assert_eq!(runner.completed(), expected);
    }

    #[tokio::test]
    async fn test_inter_command_delay_spaces_slot_reuse() {
        let runner = FakeRunner::new(Duration::from_millis(1));
        let queue = CommandQueue::new(settings(1, 25, 256), runner.clone());

        let start = Instant::now();
        for i in 0..3 {
            queue
                .submit(CommandSpec::background("s1", format!("cmd-{}", i)))
                .await;
        }
        // The third command cannot start before two full delays have passed.
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_clear_session_removes_only_matching_entries() {
        let gate = Arc::new(Semaphore::new(0));
        let runner = FakeRunner::gated(gate.clone());
        let queue = CommandQueue::new(settings(1, 1, 256), runner.clone());

        // First entry occupies the slot while the gate is shut.
        let (tx0, _rx0) = oneshot::channel();
        queue.enqueue(CommandSpec::background("s1", "blocker"), tx0);
        tokio::time::sleep(Duration::from_millis(5)).await;

        let (tx1, rx1) = oneshot::channel();
        queue.enqueue(CommandSpec::background("s2", "keep-a"), tx1);
        let (tx2, rx2) = oneshot::channel();
        queue.enqueue(CommandSpec::background("s1", "drop-me"), tx2);
        let (tx3, rx3) = oneshot::channel();
        queue.enqueue(CommandSpec::background("s2", "keep-b"), tx3);

        queue.clear_session("s1");

        // The cleared entry's callback fired with an error.
        let dropped = rx2.await.unwrap();
        assert!(dropped.error.unwrap().contains("Session closed"));

        // Survivors run in their original relative order.
        gate.add_permits(16);
        rx1.await.unwrap();
        rx3.await.unwrap();
        let completed = runner.completed();
        let keep_a = completed.iter().position(|c| c == "keep-a").unwrap();
        let keep_b = completed.iter().position(|c| c == "keep-b").unwrap();
        assert!(keep_a < keep_b);
        assert!(!completed.iter().any(|c| c == "drop-me"));
    }

    #[tokio::test]
    async fn test_overflow_is_rejected_through_callback() {
        let gate = Arc::new(Semaphore::new(0));
        let runner = FakeRunner::gated(gate.clone());
        let queue = CommandQueue::new(settings(1, 1, 1), runner.clone());

        let (tx0, _rx0) = oneshot::channel();
        queue.enqueue(CommandSpec::background("s1", "running"), tx0);
        tokio::time::sleep(Duration::from_millis(5)).await;

        let (tx1, _rx1) = oneshot::channel();
        queue.enqueue(CommandSpec::background("s1", "pending"), tx1);

        let (tx2, rx2) = oneshot::channel();
        queue.enqueue(CommandSpec::background("s1", "overflow"), tx2);
        let outcome = rx2.await.unwrap();
        assert!(outcome.error.unwrap().contains("queue is full"));

        gate.add_permits(16);
    }

    #[tokio::test]
    async fn test_state_reports_pending_and_running() {
        let gate = Arc::new(Semaphore::new(0));
        let runner = FakeRunner::gated(gate.clone());
        let queue = CommandQueue::new(settings(2, 1, 256), runner.clone());

        for i in 0..4 {
            let (tx, _rx) = oneshot::channel();
            queue.enqueue(CommandSpec::background("s1", format!("cmd-{}", i)), tx);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        let state = queue.state();
        assert_eq!(state.running, 2);
        assert_eq!(state.pending, 2);

        gate.add_permits(16);
    }

    #[tokio::test]
    async fn test_empty_queue_state() {
        let runner = FakeRunner::new(Duration::from_millis(1));
        let queue = CommandQueue::new(QueueSettings::default(), runner);
        let state = queue.state();
        assert_eq!(state, QueueState { pending: 0, running: 0 });
    }

    #[test]
    fn test_default_settings_match_protocol() {
        let settings = QueueSettings::default();
        assert_eq!(settings.max_concurrent, 3);
        assert_eq!(settings.inter_command_delay, Duration::from_millis(300));
        assert_eq!(settings.max_pending, 256);
    }
}
