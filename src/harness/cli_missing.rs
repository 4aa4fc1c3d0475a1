static CLI_MISSING_PATTERNS: &[&str] = &[
    "command not found",
    "no such file or directory",
    "cannot run program",
    "not installed",
];

/// Exit status shells and elevation agents use for "could not execute".
pub const EXIT_COMMAND_NOT_FOUND: i32 = 127;

pub fn is_cli_missing_line(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    CLI_MISSING_PATTERNS
        .iter()
        .any(|pattern| lower.contains(pattern))
}

/// A wrapped run (agent or shell in front of argv[0]) reports a missing tool
/// through its exit code and output rather than a spawn error.
pub fn indicates_missing_program(exit_code: Option<i32>, output_tail: &[String]) -> bool {
    exit_code == Some(EXIT_COMMAND_NOT_FOUND) && output_tail.iter().any(|line| is_cli_missing_line(line))
}

pub fn not_found_message(program: &str) -> String {
    format!("Command not found: {}", program)
}

#[cfg(test)]
mod tests {
    use super::{indicates_missing_program, is_cli_missing_line};

    #[test]
    fn detects_cli_missing_variants() {
        assert!(is_cli_missing_line("bash: paru: command not found"));
        assert!(is_cli_missing_line(
            "Cannot run program paru: No such file or directory"
        ));
        assert!(!is_cli_missing_line("resolving dependencies..."));
    }

    #[test]
    fn requires_both_exit_code_and_message() {
        let tail = vec!["pkexec: paru: command not found".to_string()];
        assert!(indicates_missing_program(Some(127), &tail));
        assert!(!indicates_missing_program(Some(1), &tail));
        assert!(!indicates_missing_program(Some(127), &["error: target not found: x".to_string()]));
    }
}
