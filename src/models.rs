use crate::errors::EngineError;
use crate::harness::terminal::TerminalCandidate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// An external operation to run: argv plus how it expects to be elevated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandSpec {
    pub argv: Vec<String>,
    pub needs_privilege: bool,
    pub is_interactive_helper: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_hint: Option<u32>,
}

impl CommandSpec {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            needs_privilege: false,
            is_interactive_helper: false,
            line_hint: None,
        }
    }

    pub fn privileged(mut self) -> Self {
        self.needs_privilege = true;
        self
    }

    pub fn interactive_helper(mut self) -> Self {
        self.is_interactive_helper = true;
        self
    }

    pub fn with_line_hint(mut self, lines: u32) -> Self {
        self.line_hint = Some(lines);
        self
    }

    pub fn program(&self) -> Option<&str> {
        self.argv.first().map(String::as_str)
    }

    pub fn operation_key(&self) -> OperationKey {
        OperationKey::from_argv(&self.argv)
    }

    /// First few argv tokens, for status lines and logs.
    pub fn short_display(&self) -> String {
        self.argv
            .iter()
            .take(3)
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Coarse bucket for historical samples: base program name plus the first
/// short-form flag, e.g. `pacman_-S`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationKey(String);

impl OperationKey {
    pub fn from_argv(argv: &[String]) -> Self {
        let Some(program) = argv.first() else {
            return Self("unknown".to_string());
        };
        let base = Path::new(program)
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(program.as_str());
        let flag = argv[1..]
            .iter()
            .find(|arg| arg.starts_with('-') && !arg.starts_with("--"));

        match flag {
            Some(flag) => Self(format!("{}_{}", base, flag)),
            None => Self(base.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for OperationKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for OperationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prediction {
    pub estimated_total_lines: u32,
    pub estimated_duration: Option<f64>,
    /// False when no line-count sample exists for the key yet.
    pub has_line_history: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EscalationStrategy {
    Direct,
    Elevated,
    ElevatedInteractive,
    VisibleTerminal,
}

impl EscalationStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Elevated => "elevated",
            Self::ElevatedInteractive => "elevated-interactive",
            Self::VisibleTerminal => "visible-terminal",
        }
    }

    /// Whether the engine can read the child's output under this strategy.
    pub fn is_observable(self) -> bool {
        !matches!(self, Self::VisibleTerminal)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Outcome {
    Succeeded,
    Failed { exit_code: Option<i32> },
    NotFound,
    Cancelled,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed { .. } => "failed",
            Self::NotFound => "not-found",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, Self::Succeeded)
    }

    /// Only runs that went the distance are valid timing samples.
    pub fn records_history(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed { .. })
    }

    pub fn from_error(error: &EngineError) -> Self {
        match error {
            EngineError::NotFound(_) => Self::NotFound,
            EngineError::NonZeroExit { code, .. } => Self::Failed { exit_code: *code },
            EngineError::Cancelled => Self::Cancelled,
            EngineError::Persistence(_)
            | EngineError::EscalationUnavailable(_)
            | EngineError::Io(_)
            | EngineError::Internal(_) => Self::Failed { exit_code: None },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    StatusChanged {
        message: String,
    },
    LineReceived {
        text: String,
    },
    Progress {
        percent: u8,
        remaining_secs: Option<f64>,
        eta: Option<String>,
    },
    Indeterminate {
        active: bool,
    },
    Terminated {
        outcome: Outcome,
        message: String,
    },
}

impl ExecutionEvent {
    pub fn status(message: impl Into<String>) -> Self {
        Self::StatusChanged {
            message: message.into(),
        }
    }

    pub fn terminated(outcome: Outcome, message: impl Into<String>) -> Self {
        Self::Terminated {
            outcome,
            message: message.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionState {
    Created,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    NotFound,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Created | Self::Running)
    }

    pub fn from_outcome(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Succeeded => Self::Succeeded,
            Outcome::Failed { .. } => Self::Failed,
            Outcome::NotFound => Self::NotFound,
            Outcome::Cancelled => Self::Cancelled,
        }
    }
}

/// Snapshot of host probes taken at the start of a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostCapabilities {
    pub elevation_agent: Option<String>,
    pub terminal: Option<TerminalCandidate>,
}

impl HostCapabilities {
    pub fn has_elevation_agent(&self) -> bool {
        self.elevation_agent.is_some()
    }

    pub fn has_terminal(&self) -> bool {
        self.terminal.is_some()
    }
}
