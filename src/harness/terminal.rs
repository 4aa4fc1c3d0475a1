use serde::{Deserialize, Serialize};

const CLOSE_PROMPT: &str = "echo; read -p 'Press Enter to close'";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalCandidate {
    pub program: String,
    /// Arguments placed between the program and `bash -c <script>`.
    pub args_prefix: Vec<String>,
}

impl TerminalCandidate {
    pub fn new(program: &str, args_prefix: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args_prefix: args_prefix.iter().map(|arg| (*arg).to_string()).collect(),
        }
    }

    /// Full argv that opens the terminal, runs `argv` and waits for Enter so
    /// the user can read the result.
    pub fn wrap(&self, argv: &[String]) -> Vec<String> {
        let script = format!("{}; {}", join_quoted(argv), CLOSE_PROMPT);
        let mut full = Vec::with_capacity(self.args_prefix.len() + 4);
        full.push(self.program.clone());
        full.extend(self.args_prefix.iter().cloned());
        full.push("bash".to_string());
        full.push("-c".to_string());
        full.push(script);
        full
    }
}

pub fn default_candidates() -> Vec<TerminalCandidate> {
    vec![
        TerminalCandidate::new("gnome-terminal", &["--"]),
        TerminalCandidate::new("konsole", &["-e"]),
        TerminalCandidate::new("xfce4-terminal", &["-x"]),
        TerminalCandidate::new("xterm", &["-e"]),
        TerminalCandidate::new("alacritty", &["-e"]),
    ]
}

pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | '=' | ':' | '+' | ','))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', "'\"'\"'"))
}

pub fn join_quoted(argv: &[String]) -> String {
    argv.iter()
        .map(|arg| shell_quote(arg))
        .collect::<Vec<_>>()
        .join(" ")
}
