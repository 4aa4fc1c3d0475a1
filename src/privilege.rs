use crate::config::EngineConfig;
use crate::errors::{EngineError, EngineResult};
use crate::harness::terminal::TerminalCandidate;
use crate::models::{CommandSpec, EscalationStrategy, HostCapabilities};

/// Side-effect free host queries. Re-run at the start of every session since
/// tools can be installed or removed between runs.
pub trait HostProbe: Send + Sync {
    fn is_executable_on_path(&self, program: &str) -> bool;
    fn elevation_agent(&self) -> Option<String>;
    fn terminal_emulator(&self) -> Option<TerminalCandidate>;

    fn capabilities(&self) -> HostCapabilities {
        HostCapabilities {
            elevation_agent: self.elevation_agent(),
            terminal: self.terminal_emulator(),
        }
    }
}

/// Probes the real search path.
#[derive(Debug, Clone)]
pub struct SystemProbe {
    agent: String,
    terminals: Vec<TerminalCandidate>,
}

impl SystemProbe {
    pub fn new(agent: impl Into<String>, terminals: Vec<TerminalCandidate>) -> Self {
        Self {
            agent: agent.into(),
            terminals,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.elevation_agent.clone(), config.terminal_candidates.clone())
    }
}

impl HostProbe for SystemProbe {
    fn is_executable_on_path(&self, program: &str) -> bool {
        !program.is_empty() && which::which(program).is_ok()
    }

    fn elevation_agent(&self) -> Option<String> {
        self.is_executable_on_path(&self.agent)
            .then(|| self.agent.clone())
    }

    fn terminal_emulator(&self) -> Option<TerminalCandidate> {
        self.terminals
            .iter()
            .find(|candidate| self.is_executable_on_path(&candidate.program))
            .cloned()
    }
}

/// Fixed capability answers with real path lookups; used where the host's
/// agent and terminal must not influence the result.
#[derive(Debug, Clone, Default)]
pub struct FixedProbe {
    pub agent: Option<String>,
    pub terminal: Option<TerminalCandidate>,
}

impl FixedProbe {
    pub fn bare() -> Self {
        Self::default()
    }
}

impl HostProbe for FixedProbe {
    fn is_executable_on_path(&self, program: &str) -> bool {
        !program.is_empty() && which::which(program).is_ok()
    }

    fn elevation_agent(&self) -> Option<String> {
        self.agent.clone()
    }

    fn terminal_emulator(&self) -> Option<TerminalCandidate> {
        self.terminal.clone()
    }
}

/// Concrete process to spawn for a spec under a strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub strategy: EscalationStrategy,
}

impl Invocation {
    fn from_argv(mut argv: Vec<String>, strategy: EscalationStrategy) -> EngineResult<Self> {
        if argv.is_empty() {
            return Err(EngineError::Internal("empty command".to_string()));
        }
        let program = argv.remove(0);
        Ok(Self {
            program,
            args: argv,
            strategy,
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PrivilegeEscalator;

impl PrivilegeEscalator {
    pub fn new() -> Self {
        Self
    }

    /// First matching rule wins:
    /// unprivileged runs directly; interactive helpers get a visible prompt
    /// (agent as the invoking user, else a terminal, else direct); other
    /// privileged runs go silently through the agent when one exists.
    pub fn choose(&self, spec: &CommandSpec, caps: &HostCapabilities) -> EscalationStrategy {
        if !spec.needs_privilege {
            return EscalationStrategy::Direct;
        }
        if spec.is_interactive_helper {
            if caps.has_elevation_agent() {
                return EscalationStrategy::ElevatedInteractive;
            }
            if caps.has_terminal() {
                return EscalationStrategy::VisibleTerminal;
            }
            return EscalationStrategy::Direct;
        }
        if caps.has_elevation_agent() {
            EscalationStrategy::Elevated
        } else {
            EscalationStrategy::Direct
        }
    }

    /// True when an interactive privileged helper had to fall back to a
    /// direct run and can only fail on its own prompt.
    pub fn is_degraded(&self, spec: &CommandSpec, strategy: EscalationStrategy) -> bool {
        spec.needs_privilege && spec.is_interactive_helper && strategy == EscalationStrategy::Direct
    }

    pub fn invocation(
        &self,
        spec: &CommandSpec,
        strategy: EscalationStrategy,
        caps: &HostCapabilities,
    ) -> EngineResult<Invocation> {
        let argv = spec.argv.clone();
        match strategy {
            EscalationStrategy::Direct => Invocation::from_argv(argv, strategy),
            EscalationStrategy::Elevated => {
                let agent = required_agent(caps)?;
                let mut full = vec![agent];
                full.extend(argv);
                Invocation::from_argv(full, strategy)
            }
            EscalationStrategy::ElevatedInteractive => {
                let agent = required_agent(caps)?;
                let user = std::env::var("USER")
                    .ok()
                    .filter(|value| !value.is_empty())
                    .unwrap_or_else(|| "root".to_string());
                let mut full = vec![agent.clone()];
                full.extend(run_as_user_args(&agent, user));
                full.extend(argv);
                Invocation::from_argv(full, strategy)
            }
            EscalationStrategy::VisibleTerminal => {
                let terminal = caps.terminal.as_ref().ok_or_else(|| {
                    EngineError::EscalationUnavailable(
                        "no terminal emulator found to show the authentication prompt".to_string(),
                    )
                })?;
                Invocation::from_argv(terminal.wrap(&argv), strategy)
            }
        }
    }
}

fn required_agent(caps: &HostCapabilities) -> EngineResult<String> {
    caps.elevation_agent.clone().ok_or_else(|| {
        EngineError::EscalationUnavailable("no privilege elevation agent is installed".to_string())
    })
}

/// Arguments that make `agent` keep the invoking user's identity, in the
/// agent's own syntax. Unknown agents get none.
pub fn run_as_user_args(agent: &str, user: String) -> Vec<String> {
    let name = std::path::Path::new(agent)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(agent);
    match name {
        "pkexec" => vec!["--user".to_string(), user, "--".to_string()],
        "sudo" => vec!["-u".to_string(), user, "--".to_string()],
        "doas" => vec!["-u".to_string(), user],
        other => {
            tracing::warn!(agent = other, "unknown elevation agent; not passing a target user");
            Vec::new()
        }
    }
}

pub fn escalation_unavailable_message() -> &'static str {
    "No elevation agent or terminal emulator is available to authenticate this operation"
}
