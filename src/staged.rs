use crate::executor::CANCELLED_MESSAGE;
use crate::harness::cli_missing::not_found_message;
use crate::models::{CommandSpec, ExecutionEvent, Outcome};
use crate::session::{open_channel, EventSink, SessionContext, SessionHandle};
use uuid::Uuid;

pub const STAGED_SUCCESS_MESSAGE: &str = "Package installed successfully";

/// One step of a multi-command install, e.g. "Extracting package...".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    pub status: String,
    pub spec: CommandSpec,
}

impl Stage {
    pub fn new(status: impl Into<String>, spec: CommandSpec) -> Self {
        Self {
            status: status.into(),
            spec,
        }
    }
}

/// Runs stages in order and reports coarse status transitions only.
///
/// Stage output is not line-counted and nothing is written to history.
pub struct StagedInstall {
    stages: Vec<Stage>,
    context: SessionContext,
    success_message: String,
}

impl StagedInstall {
    pub fn new(stages: Vec<Stage>, context: SessionContext) -> Self {
        Self {
            stages,
            context,
            success_message: STAGED_SUCCESS_MESSAGE.to_string(),
        }
    }

    pub fn with_success_message(mut self, message: impl Into<String>) -> Self {
        self.success_message = message.into();
        self
    }

    pub fn start(self) -> SessionHandle {
        let (handle, sink) = open_channel();
        let session_id = handle.id();
        tokio::spawn(async move {
            self.drive(session_id, sink).await;
        });
        handle
    }

    async fn drive(self, session_id: Uuid, mut sink: EventSink) {
        sink.set_running();
        sink.send(ExecutionEvent::Indeterminate { active: true }).await;
        let total = self.stages.len();

        for (index, stage) in self.stages.iter().enumerate() {
            if sink.is_cancelled() {
                sink.finish(Outcome::Cancelled, CANCELLED_MESSAGE.to_string()).await;
                return;
            }
            tracing::info!(
                session_id = %session_id,
                stage = index + 1,
                total,
                status = %stage.status,
                "staged install step"
            );
            sink.send(ExecutionEvent::status(stage.status.clone())).await;

            let (outcome, message) = self.run_stage(stage, &sink).await;
            match outcome {
                Outcome::Succeeded => continue,
                Outcome::Cancelled => {
                    sink.finish(outcome, message).await;
                    return;
                }
                Outcome::Failed { .. } | Outcome::NotFound => {
                    tracing::warn!(session_id = %session_id, status = %stage.status, outcome = outcome.as_str(), "stage failed");
                    sink.finish(outcome, format!("{} {}", stage.status, message)).await;
                    return;
                }
            }
        }

        sink.finish(Outcome::Succeeded, self.success_message.clone()).await;
    }

    async fn run_stage(&self, stage: &Stage, sink: &EventSink) -> (Outcome, String) {
        let spec = &stage.spec;
        let program = spec.program().unwrap_or_default().to_string();
        if !self.context.probe.is_executable_on_path(&program) {
            return (Outcome::NotFound, not_found_message(&program));
        }

        let caps = self.context.probe.capabilities();
        let strategy = self.context.escalator.choose(spec, &caps);
        let invocation = match self.context.escalator.invocation(spec, strategy, &caps) {
            Ok(invocation) => invocation,
            Err(error) => return (Outcome::from_error(&error), error.to_string()),
        };

        let mut events = self
            .context
            .executor
            .run(spec, invocation, false, sink.cancel_signal());
        while let Some(event) = events.recv().await {
            if let ExecutionEvent::Terminated { outcome, message } = event {
                return (outcome, message);
            }
        }
        (
            Outcome::Failed { exit_code: None },
            "Execution ended unexpectedly".to_string(),
        )
    }
}
