pub mod config;
pub mod errors;
pub mod eta;
pub mod executor;
pub mod harness;
pub mod history;
pub mod models;
pub mod privilege;
pub mod progress;
pub mod session;
pub mod staged;

pub use crate::config::EngineConfig;
pub use crate::errors::{EngineError, EngineResult};
pub use crate::eta::EtaModel;
pub use crate::executor::{CancelSignal, CommandExecutor, ExecutorOptions};
pub use crate::history::{HistoryStore, JsonFileStore, MemoryStore, OperationHistory};
pub use crate::models::{
    CommandSpec, EscalationStrategy, ExecutionEvent, HostCapabilities, OperationKey, Outcome, Prediction,
    SessionState,
};
pub use crate::privilege::{FixedProbe, HostProbe, PrivilegeEscalator, SystemProbe};
pub use crate::progress::ProgressEstimator;
pub use crate::session::{ExecutionSession, SessionCanceller, SessionContext, SessionHandle};
pub use crate::staged::{Stage, StagedInstall};

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();
static LOG_INIT: std::sync::OnceLock<Result<(), String>> = std::sync::OnceLock::new();

/// JSON logs to a daily rolling `engine.log` under `log_dir`. Only the first
/// call installs the subscriber; later calls return that call's result.
pub fn init_tracing(log_dir: &Path) -> Result<(), String> {
    LOG_INIT.get_or_init(|| install_tracing(log_dir)).clone()
}

fn install_tracing(log_dir: &Path) -> Result<(), String> {
    std::fs::create_dir_all(log_dir).map_err(|error| error.to_string())?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "engine.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| error.to_string())
}
