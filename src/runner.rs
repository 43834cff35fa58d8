//! Minimal runner detection / command modification boundary (A5).
//!
//! Real per-runner detection (inspecting `package.json`, `Cargo.toml`,
//! `go.mod`, choosing between Jest/Vitest/pytest/`go test`/`cargo test`, and
//! injecting the matching reporter) is out of scope (spec.md §1): it is a
//! collaborator concern. This module is a thin stand-in so the orchestrator's
//! `Prepared` state always has a `modified_command` to record and the binary
//! runs end-to-end without that matrix.

/// The (currently single) runner family this stand-in recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerKind {
    /// No real detection is performed; every command is treated generically.
    Generic,
}

impl RunnerKind {
    pub fn label(self) -> &'static str {
        match self {
            RunnerKind::Generic => "generic",
        }
    }
}

/// The result of detecting and (potentially) rewriting the user's command.
#[derive(Debug, Clone)]
pub struct DetectedCommand {
    pub kind: RunnerKind,
    /// The command actually executed, after any reporter injection. Equal to
    /// the input command today, since the generic stand-in never rewrites it.
    pub modified_command: Vec<String>,
    /// Whether the child should be run with `THREEPIO_IPC_PATH` set so an
    /// injected reporter (if one existed) could use it.
    pub uses_ipc: bool,
}

impl DetectedCommand {
    pub fn command_line(&self) -> String {
        shell_join(&self.modified_command)
    }
}

fn shell_join(parts: &[String]) -> String {
    parts
        .iter()
        .map(|p| {
            if p.is_empty() || p.chars().any(|c| c.is_whitespace() || c == '"') {
                format!("\"{}\"", p.replace('"', "\\\""))
            } else {
                p.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Detects the runner for `command` and returns the command to actually
/// execute. The generic stand-in never rewrites the command: it is returned
/// unmodified, with `uses_ipc = true` so both producers (C5 and C6) are
/// always live, per the reasoning in DESIGN.md — the model's idempotent
/// handling makes their interleaving irrelevant even when only one actually
/// emits anything.
pub fn detect_and_modify(command: &[String]) -> DetectedCommand {
    DetectedCommand {
        kind: RunnerKind::Generic,
        modified_command: command.to_vec(),
        uses_ipc: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generic_command_is_unmodified() {
        let cmd = vec!["npm".to_string(), "test".to_string()];
        let detected = detect_and_modify(&cmd);
        assert_eq!(detected.modified_command, cmd);
        assert_eq!(detected.kind.label(), "generic");
        assert!(detected.uses_ipc);
    }

    #[test]
    fn command_line_quotes_args_with_whitespace() {
        let cmd = vec!["echo".to_string(), "hello world".to_string()];
        let detected = detect_and_modify(&cmd);
        assert_eq!(detected.command_line(), "echo \"hello world\"");
    }
}
