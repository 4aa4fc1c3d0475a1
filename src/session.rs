use crate::config::EngineConfig;
use crate::eta::EtaModel;
use crate::executor::{CancelSignal, CommandExecutor, ExecutorOptions};
use crate::harness::cli_missing::not_found_message;
use crate::history::{HistoryStore, JsonFileStore, OperationHistory};
use crate::models::{CommandSpec, ExecutionEvent, Outcome, SessionState};
use crate::privilege::{escalation_unavailable_message, HostProbe, PrivilegeEscalator, SystemProbe};
use crate::progress::ProgressEstimator;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use uuid::Uuid;

const SESSION_CHANNEL_CAPACITY: usize = 256;

/// Collaborators shared by every session: the one shared mutable resource
/// (history) plus host probing and process execution.
#[derive(Clone)]
pub struct SessionContext {
    pub eta: EtaModel,
    pub probe: Arc<dyn HostProbe>,
    pub escalator: PrivilegeEscalator,
    pub executor: CommandExecutor,
}

impl SessionContext {
    pub fn new(store: Arc<dyn HistoryStore>, probe: Arc<dyn HostProbe>, options: ExecutorOptions) -> Self {
        Self {
            eta: EtaModel::new(Arc::new(OperationHistory::new(store))),
            probe,
            escalator: PrivilegeEscalator::new(),
            executor: CommandExecutor::new(options),
        }
    }

    /// Real host probes and the per-user history file.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            Arc::new(JsonFileStore::new(config.history_path.clone())),
            Arc::new(SystemProbe::from_config(config)),
            ExecutorOptions::from_config(config),
        )
    }
}

/// Cloneable cancel trigger, usable from any thread.
#[derive(Debug, Clone)]
pub struct SessionCanceller {
    signal: Arc<CancelSignal>,
}

impl SessionCanceller {
    pub fn cancel(&self) {
        self.signal.cancel();
    }
}

/// Caller side of a running session.
pub struct SessionHandle {
    id: Uuid,
    started_at: DateTime<Utc>,
    cancel: Arc<CancelSignal>,
    events: mpsc::Receiver<ExecutionEvent>,
    state: watch::Receiver<SessionState>,
}

impl SessionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn canceller(&self) -> SessionCanceller {
        SessionCanceller {
            signal: self.cancel.clone(),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// `None` once `Terminated` has been delivered.
    pub async fn next_event(&mut self) -> Option<ExecutionEvent> {
        self.events.recv().await
    }

    /// Drains the stream, returning every event in order.
    pub async fn collect(mut self) -> Vec<ExecutionEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.events.recv().await {
            events.push(event);
        }
        events
    }
}

/// Forwards events to the caller and owns the session state transitions.
pub(crate) struct EventSink {
    events: mpsc::Sender<ExecutionEvent>,
    state: watch::Sender<SessionState>,
    cancel: Arc<CancelSignal>,
    detached: bool,
}

impl EventSink {
    pub(crate) async fn send(&mut self, event: ExecutionEvent) {
        if self.detached {
            return;
        }
        if self.events.send(event).await.is_err() {
            tracing::warn!("session receiver dropped; cancelling");
            self.detached = true;
            self.cancel.cancel();
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn cancel_signal(&self) -> Arc<CancelSignal> {
        self.cancel.clone()
    }

    pub(crate) fn set_running(&self) {
        self.state.send_replace(SessionState::Running);
    }

    /// Moves to the terminal state before delivering the last event.
    pub(crate) async fn finish(&mut self, outcome: Outcome, message: String) {
        self.state.send_replace(SessionState::from_outcome(outcome));
        self.send(ExecutionEvent::terminated(outcome, message)).await;
    }
}

pub(crate) fn open_channel() -> (SessionHandle, EventSink) {
    let (events_tx, events_rx) = mpsc::channel(SESSION_CHANNEL_CAPACITY);
    let (state_tx, state_rx) = watch::channel(SessionState::Created);
    let cancel = CancelSignal::new();
    let handle = SessionHandle {
        id: Uuid::new_v4(),
        started_at: Utc::now(),
        cancel: cancel.clone(),
        events: events_rx,
        state: state_rx,
    };
    let sink = EventSink {
        events: events_tx,
        state: state_tx,
        cancel,
        detached: false,
    };
    (handle, sink)
}

/// One invocation of one command: predict, choose a strategy, run, learn.
///
/// Terminates in exactly one of succeeded / failed / cancelled / not-found and
/// is consumed by `start`, so it cannot be reused.
pub struct ExecutionSession {
    spec: CommandSpec,
    context: SessionContext,
}

impl ExecutionSession {
    pub fn new(spec: CommandSpec, context: SessionContext) -> Self {
        Self { spec, context }
    }

    pub fn spec(&self) -> &CommandSpec {
        &self.spec
    }

    /// Spawns the supervising task and returns immediately.
    pub fn start(self) -> SessionHandle {
        let (handle, sink) = open_channel();
        let session_id = handle.id();
        tokio::spawn(async move {
            self.drive(session_id, sink).await;
        });
        handle
    }

    async fn drive(self, session_id: Uuid, mut sink: EventSink) {
        let ExecutionSession { spec, context } = self;
        sink.set_running();

        // First use loads the history file and probing walks PATH.
        let prepared = {
            let eta = context.eta.clone();
            let probe = context.probe.clone();
            let spec = spec.clone();
            tokio::task::spawn_blocking(move || {
                let program = spec.program().unwrap_or_default();
                let found = probe.is_executable_on_path(program);
                (eta.predict(&spec), probe.capabilities(), found)
            })
            .await
        };
        let (prediction, caps, program_found) = match prepared {
            Ok(prepared) => prepared,
            Err(error) => {
                tracing::error!(session_id = %session_id, error = %error, "session preparation failed");
                sink.finish(
                    Outcome::Failed { exit_code: None },
                    format!("Failed to prepare session: {}", error),
                )
                .await;
                return;
            }
        };
        let strategy = context.escalator.choose(&spec, &caps);
        let degraded = context.escalator.is_degraded(&spec, strategy);
        let key = spec.operation_key();
        tracing::info!(
            session_id = %session_id,
            key = %key,
            strategy = strategy.as_str(),
            estimated_lines = prediction.estimated_total_lines,
            estimated_duration = ?prediction.estimated_duration,
            "session starting"
        );
        if degraded {
            tracing::warn!(session_id = %session_id, key = %key, "no elevation path for interactive helper; running directly");
        }

        let program = spec.program().unwrap_or_default().to_string();
        if !program_found {
            tracing::warn!(session_id = %session_id, program = %program, "program not on search path");
            sink.finish(Outcome::NotFound, not_found_message(&program)).await;
            return;
        }

        let invocation = match context.escalator.invocation(&spec, strategy, &caps) {
            Ok(invocation) => invocation,
            Err(error) => {
                sink.finish(Outcome::from_error(&error), error.to_string()).await;
                return;
            }
        };

        let indeterminate = !prediction.has_line_history && strategy.is_observable();
        let mut estimator = ProgressEstimator::new(&prediction, spec.line_hint);
        let started = Instant::now();
        let mut lines_seen: u32 = 0;
        let mut events = context
            .executor
            .run(&spec, invocation, indeterminate, sink.cancel_signal());

        while let Some(event) = events.recv().await {
            match event {
                ExecutionEvent::LineReceived { text } => {
                    lines_seen = lines_seen.saturating_add(1);
                    sink.send(ExecutionEvent::LineReceived { text }).await;
                    let tick = estimator.tick(lines_seen, started.elapsed().as_secs_f64());
                    sink.send(ExecutionEvent::Progress {
                        percent: tick.percent,
                        remaining_secs: tick.remaining_secs,
                        eta: tick.eta,
                    })
                    .await;
                }
                ExecutionEvent::Terminated { outcome, message } => {
                    let elapsed = started.elapsed().as_secs_f64();
                    if outcome.records_history() && strategy.is_observable() {
                        let eta = context.eta.clone();
                        let recorded_spec = spec.clone();
                        let recorded = tokio::task::spawn_blocking(move || {
                            eta.record(&recorded_spec, lines_seen, elapsed)
                        })
                        .await;
                        if let Err(error) = recorded {
                            tracing::warn!(session_id = %session_id, error = %error, "history record task failed");
                        }
                    }
                    let message = if degraded && matches!(outcome, Outcome::Failed { .. }) {
                        format!("{}. {}", escalation_unavailable_message(), message)
                    } else {
                        message
                    };
                    tracing::info!(
                        session_id = %session_id,
                        key = %key,
                        outcome = outcome.as_str(),
                        lines = lines_seen,
                        duration_secs = elapsed,
                        "session finished"
                    );
                    sink.finish(outcome, message).await;
                    return;
                }
                other => sink.send(other).await,
            }
        }

        tracing::error!(session_id = %session_id, "executor stopped without a terminal event");
        sink.finish(
            Outcome::Failed { exit_code: None },
            "Execution ended unexpectedly".to_string(),
        )
        .await;
    }
}
