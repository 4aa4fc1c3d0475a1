use crate::config::EngineConfig;
use crate::harness::cli_missing::{indicates_missing_program, not_found_message};
use crate::harness::line_buffer::LineBuffer;
use crate::models::{CommandSpec, ExecutionEvent, Outcome};
use crate::privilege::Invocation;
use once_cell::sync::Lazy;
use std::collections::VecDeque;
use std::io::Read;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Notify};
use tokio::time::{timeout, Duration, Instant};

static ANSI_ESCAPE_RE: Lazy<regex::Regex> = Lazy::new(|| {
    regex::Regex::new(r"\x1B(?:[@-Z\\-_]|\[[0-?]*[ -/]*[@-~])").expect("valid ansi escape regex")
});

const EVENT_CHANNEL_CAPACITY: usize = 256;
const READ_CHUNK_BYTES: usize = 8 * 1024;
const MAX_PENDING_LINE_BYTES: usize = 1_000_000;
const MAX_TAIL_LINES: usize = 200;
const KILL_WAIT: Duration = Duration::from_secs(2);

pub const CANCELLED_MESSAGE: &str = "Cancelled by user";
pub const TERMINAL_OPENED_MESSAGE: &str = "Opened terminal, complete installation there.";
pub const TERMINAL_CLOSED_MESSAGE: &str = "Terminal closed; result of the command is not observable";

/// Cooperative cancellation flag shared between a session handle and the
/// supervising task. Safe to trigger from any thread, any number of times.
#[derive(Debug, Default)]
pub struct CancelSignal {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelSignal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    pub indeterminate_grace: Duration,
    pub output_drain: Duration,
    pub max_diagnostic_chars: usize,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

impl ExecutorOptions {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            indeterminate_grace: config.indeterminate_grace(),
            output_drain: config.output_drain(),
            max_diagnostic_chars: config.max_diagnostic_chars,
        }
    }
}

/// Most recent output lines, kept for the failure message.
#[derive(Default)]
struct OutputTail {
    lines: VecDeque<String>,
}

impl OutputTail {
    fn push(&mut self, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        self.lines.push_back(line.to_string());
        while self.lines.len() > MAX_TAIL_LINES {
            self.lines.pop_front();
        }
    }

    fn lines(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }

    fn diagnostic(&self, max_chars: usize) -> String {
        let joined = self
            .lines
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n");
        truncate_front(&joined, max_chars)
    }
}

enum Step {
    Cancel,
    Line(Option<String>),
    GraceElapsed,
    Exited(std::io::Result<ExitStatus>),
}

/// Owns the child process lifecycle for one invocation and reports it as an
/// ordered event stream ending in exactly one `Terminated`.
#[derive(Debug, Clone, Default)]
pub struct CommandExecutor {
    options: ExecutorOptions,
}

impl CommandExecutor {
    pub fn new(options: ExecutorOptions) -> Self {
        Self { options }
    }

    /// Must be called from inside a tokio runtime.
    pub fn run(
        &self,
        spec: &CommandSpec,
        invocation: Invocation,
        indeterminate: bool,
        cancel: Arc<CancelSignal>,
    ) -> mpsc::Receiver<ExecutionEvent> {
        let (events, receiver) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let supervisor = Supervisor {
            spec: spec.clone(),
            invocation,
            options: self.options.clone(),
            events,
            cancel,
        };
        tokio::spawn(async move {
            if supervisor.invocation.strategy.is_observable() {
                supervisor.run_observed(indeterminate).await;
            } else {
                supervisor.run_in_terminal().await;
            }
        });
        receiver
    }
}

struct Supervisor {
    spec: CommandSpec,
    invocation: Invocation,
    options: ExecutorOptions,
    events: mpsc::Sender<ExecutionEvent>,
    cancel: Arc<CancelSignal>,
}

impl Supervisor {
    async fn emit(&self, event: ExecutionEvent) -> bool {
        self.events.send(event).await.is_ok()
    }

    async fn terminate(&self, outcome: Outcome, message: impl Into<String>) {
        let message = message.into();
        tracing::info!(
            program = %self.invocation.program,
            outcome = outcome.as_str(),
            message = %message,
            "command terminated"
        );
        let _ = self.emit(ExecutionEvent::terminated(outcome, message)).await;
    }

    async fn run_observed(self, indeterminate: bool) {
        if self.cancel.is_cancelled() {
            self.terminate(Outcome::Cancelled, CANCELLED_MESSAGE).await;
            return;
        }

        let (reader, writer) = match std::io::pipe() {
            Ok(pair) => pair,
            Err(error) => {
                self.terminate(
                    Outcome::Failed { exit_code: None },
                    format!("Failed to create output pipe: {}", error),
                )
                .await;
                return;
            }
        };
        let stderr_writer = match writer.try_clone() {
            Ok(clone) => clone,
            Err(error) => {
                self.terminate(
                    Outcome::Failed { exit_code: None },
                    format!("Failed to create output pipe: {}", error),
                )
                .await;
                return;
            }
        };

        let mut command = Command::new(&self.invocation.program);
        command
            .args(&self.invocation.args)
            .stdin(Stdio::null())
            .stdout(writer)
            .stderr(stderr_writer)
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let spawned = command.spawn();
        // Drop the parent's write ends so the reader sees EOF when the child exits.
        drop(command);
        let mut child = match spawned {
            Ok(child) => child,
            Err(error) => {
                self.report_spawn_failure(error).await;
                return;
            }
        };
        let pgid = child.id();
        tracing::info!(
            pid = pgid,
            program = %self.invocation.program,
            strategy = self.invocation.strategy.as_str(),
            "command spawned"
        );

        let mut lines = spawn_line_reader(reader);
        let mut indeterminate_pending = indeterminate;
        if indeterminate && !self.emit(ExecutionEvent::Indeterminate { active: true }).await {
            force_kill(&mut child).await;
            return;
        }
        if !self
            .emit(ExecutionEvent::status(format!("Running: {}...", self.spec.short_display())))
            .await
        {
            force_kill(&mut child).await;
            return;
        }

        let started = Instant::now();
        let grace = tokio::time::sleep(self.options.indeterminate_grace);
        tokio::pin!(grace);
        let mut tail = OutputTail::default();
        let mut lines_open = true;
        let mut exit_status = None;

        while exit_status.is_none() || lines_open {
            let step = if exit_status.is_none() {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => Step::Cancel,
                    line = lines.recv(), if lines_open => Step::Line(line),
                    _ = &mut grace, if indeterminate_pending => Step::GraceElapsed,
                    status = child.wait() => Step::Exited(status),
                }
            } else {
                // Exited; drain what is left in the pipe, bounded in case a
                // grandchild still holds it open.
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => Step::Cancel,
                    line = timeout(self.options.output_drain, lines.recv()) => match line {
                        Ok(line) => Step::Line(line),
                        Err(_) => Step::Line(None),
                    },
                }
            };

            match step {
                Step::Cancel if exit_status.is_some() => {
                    // The command already finished; only leftovers holding the
                    // pipe are killed and the exit status still decides.
                    tracing::info!("cancel after exit; dropping remaining output");
                    kill_process_group(pgid);
                    lines_open = false;
                }
                Step::Cancel => {
                    let _ = self.emit(ExecutionEvent::status("Cancelling...")).await;
                    force_kill(&mut child).await;
                    tracing::info!(
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "command cancelled"
                    );
                    self.terminate(Outcome::Cancelled, CANCELLED_MESSAGE).await;
                    return;
                }
                Step::Line(Some(text)) => {
                    if indeterminate_pending {
                        indeterminate_pending = false;
                        if !self.emit(ExecutionEvent::Indeterminate { active: false }).await {
                            force_kill(&mut child).await;
                            return;
                        }
                    }
                    tracing::trace!(line = %text, "command output");
                    tail.push(&text);
                    if !self.emit(ExecutionEvent::LineReceived { text }).await {
                        tracing::warn!("event receiver dropped; killing command");
                        force_kill(&mut child).await;
                        return;
                    }
                }
                Step::Line(None) => lines_open = false,
                Step::GraceElapsed => {
                    indeterminate_pending = false;
                    if !self.emit(ExecutionEvent::Indeterminate { active: false }).await {
                        force_kill(&mut child).await;
                        return;
                    }
                }
                Step::Exited(Ok(status)) => exit_status = Some(status),
                Step::Exited(Err(error)) => {
                    force_kill(&mut child).await;
                    self.terminate(
                        Outcome::Failed { exit_code: None },
                        format!("Failed to wait for process: {}", error),
                    )
                    .await;
                    return;
                }
            }
        }

        if indeterminate_pending {
            let _ = self.emit(ExecutionEvent::Indeterminate { active: false }).await;
        }

        let Some(status) = exit_status else {
            return;
        };
        let exit_code = status.code();
        if status.success() {
            self.terminate(Outcome::Succeeded, "Completed successfully").await;
            return;
        }

        if indicates_missing_program(exit_code, &tail.lines()) {
            let program = self.spec.program().unwrap_or_default().to_string();
            self.terminate(Outcome::NotFound, not_found_message(&program)).await;
            return;
        }

        let headline = match exit_code {
            Some(code) => format!("Exited with code {}", code),
            None => "Terminated by signal".to_string(),
        };
        let diagnostic = tail.diagnostic(self.options.max_diagnostic_chars);
        let message = if diagnostic.is_empty() {
            headline
        } else {
            format!("{}\n{}", headline, diagnostic)
        };
        self.terminate(Outcome::Failed { exit_code }, message).await;
    }

    /// The terminal owns the child's output and its exit code means nothing
    /// for the wrapped command, so closing the window reports success.
    async fn run_in_terminal(self) {
        if self.cancel.is_cancelled() {
            self.terminate(Outcome::Cancelled, CANCELLED_MESSAGE).await;
            return;
        }

        let mut command = Command::new(&self.invocation.program);
        command
            .args(&self.invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(error) => {
                tracing::warn!(terminal = %self.invocation.program, error = %error, "terminal failed to start");
                self.terminate(
                    Outcome::Failed { exit_code: None },
                    format!(
                        "{}: could not open {} ({})",
                        crate::privilege::escalation_unavailable_message(),
                        self.invocation.program,
                        error
                    ),
                )
                .await;
                return;
            }
        };
        tracing::info!(pid = child.id(), terminal = %self.invocation.program, "terminal opened");

        if !self.emit(ExecutionEvent::status(TERMINAL_OPENED_MESSAGE)).await {
            force_kill(&mut child).await;
            return;
        }

        let cancelled = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => true,
            _ = child.wait() => false,
        };
        if cancelled {
            force_kill(&mut child).await;
            self.terminate(Outcome::Cancelled, CANCELLED_MESSAGE).await;
        } else {
            self.terminate(Outcome::Succeeded, TERMINAL_CLOSED_MESSAGE).await;
        }
    }

    async fn report_spawn_failure(&self, error: std::io::Error) {
        if error.kind() == std::io::ErrorKind::NotFound {
            tracing::warn!(program = %self.invocation.program, "command not found");
            self.terminate(Outcome::NotFound, not_found_message(&self.invocation.program))
                .await;
        } else {
            tracing::warn!(program = %self.invocation.program, error = %error, "failed to spawn command");
            self.terminate(
                Outcome::Failed { exit_code: None },
                format!("Failed to start {}: {}", self.invocation.program, error),
            )
            .await;
        }
    }
}

/// Reads the merged stdout/stderr pipe on a blocking thread and forwards
/// sanitized lines in arrival order.
fn spawn_line_reader(mut reader: std::io::PipeReader) -> mpsc::Receiver<String> {
    let (sender, receiver) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    tokio::task::spawn_blocking(move || {
        let mut buffer = LineBuffer::new(Some(MAX_PENDING_LINE_BYTES));
        let mut chunk = vec![0_u8; READ_CHUNK_BYTES];
        loop {
            let size = match reader.read(&mut chunk) {
                Ok(0) => break,
                Ok(size) => size,
                Err(error) if error.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(error) => {
                    tracing::warn!(error = %error, "output read failed");
                    break;
                }
            };
            let overflowed = buffer.consume_overflowed_bytes();
            if overflowed > 0 {
                tracing::warn!(bytes = overflowed, "dropped bytes from an oversized output line");
            }
            for line in buffer.push(&chunk[..size]) {
                if sender.blocking_send(sanitize_line(&line)).is_err() {
                    return;
                }
            }
        }
        if let Some(rest) = buffer.flush() {
            let _ = sender.blocking_send(sanitize_line(&rest));
        }
    });
    receiver
}

/// SIGKILL to the whole process group, then reap.
async fn force_kill(child: &mut Child) {
    kill_process_group(child.id());
    let _ = child.start_kill();
    if timeout(KILL_WAIT, child.wait()).await.is_err() {
        tracing::warn!("killed process did not exit in time");
    }
}

/// The group id is the child's pid (`process_group(0)`) and stays valid
/// while any member is alive, even after the child itself was reaped.
fn kill_process_group(pgid: Option<u32>) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;
        if let Some(pgid) = pgid {
            if let Err(error) = killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL) {
                tracing::debug!(pgid, error = %error, "process group kill failed");
            }
        }
    }
    #[cfg(not(unix))]
    let _ = pgid;
}

pub fn sanitize_line(value: &str) -> String {
    ANSI_ESCAPE_RE.replace_all(value, "").into_owned()
}

fn truncate_front(value: &str, max_chars: usize) -> String {
    let count = value.chars().count();
    if count <= max_chars {
        return value.to_string();
    }
    let skip = count - max_chars;
    let rest: String = value.chars().skip(skip).collect();
    format!("...{}", rest)
}
