//! External command execution with consistent error handling.
//!
//! Every long-running tool the engine drives (`parted`, `mkfs.*`, `rsync`,
//! `btrfs`, `snapper`, ...) is spawned through the [`Runner`] trait so tests
//! can substitute a scripted fake. Commands are awaited synchronously and
//! their output is captured.

use anyhow::{bail, Context, Result};
use std::fmt;
use std::process::Command;
use tracing::debug;

/// Result of a command execution.
#[derive(Debug, Clone, Default)]
pub struct CommandResult {
    /// Exit code, or -1 if terminated by signal.
    pub code: i32,
    /// Captured stdout as a string.
    pub stdout: String,
    /// Captured stderr as a string.
    pub stderr: String,
}

impl CommandResult {
    /// Returns true if the command exited successfully.
    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// Get stdout, trimmed of whitespace.
    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }

    /// Get stderr, trimmed of whitespace.
    pub fn stderr_trimmed(&self) -> &str {
        self.stderr.trim()
    }
}

/// Executor for external commands.
pub trait Runner: fmt::Debug {
    /// Run the command and capture output. A non-zero exit status is not an
    /// error at this level; only a failure to spawn is.
    fn run(&self, program: &str, args: &[&str]) -> Result<CommandResult>;
}

/// Run through any runner and fail with the captured stderr on non-zero exit.
pub fn run_checked(
    runner: &(impl Runner + ?Sized),
    program: &str,
    args: &[&str],
    error_prefix: &str,
) -> Result<CommandResult> {
    let result = runner.run(program, args)?;
    if !result.success() {
        let stderr = result.stderr_trimmed();
        if stderr.is_empty() {
            bail!("{} (exit code {})", error_prefix, result.code);
        }
        bail!("{} (exit code {}):\n{}", error_prefix, result.code, stderr);
    }
    Ok(result)
}

/// Production runner spawning real processes.
#[derive(Debug, Default)]
pub struct SystemRunner;

impl Runner for SystemRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<CommandResult> {
        debug!("Running: {} {}", program, args.join(" "));
        let output = Command::new(program)
            .args(args)
            .output()
            .with_context(|| format!("Failed to execute '{}'. Is it installed?", program))?;

        let result = CommandResult {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        if !result.success() {
            debug!(
                "'{}' exited with code {}: {}",
                program,
                result.code,
                result.stderr_trimmed()
            );
        }
        Ok(result)
    }
}

/// Check if a program exists in PATH.
///
/// Returns the full path if found, None otherwise.
pub fn which(runner: &(impl Runner + ?Sized), program: &str) -> Option<String> {
    let result = runner.run("which", &[program]).ok()?;
    if result.success() {
        let path = result.stdout_trimmed();
        if !path.is_empty() {
            return Some(path.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_success() {
        let runner = SystemRunner;
        let result = runner.run("echo", &["hello"]).unwrap();
        assert!(result.success());
        assert_eq!(result.stdout_trimmed(), "hello");
    }

    #[test]
    fn test_run_captures_stderr() {
        // `ls` on a non-existent file writes to stderr
        let runner = SystemRunner;
        let result = runner.run("ls", &["/nonexistent_path_12345"]).unwrap();
        assert!(!result.success());
        assert!(!result.stderr.is_empty());
    }

    #[test]
    fn test_run_checked_failure_includes_prefix() {
        let runner = SystemRunner;
        let err = run_checked(&runner, "ls", &["/nonexistent_path_12345"], "listing failed")
            .unwrap_err();
        assert!(err.to_string().contains("listing failed"));
    }

    #[test]
    fn test_run_missing_program() {
        let runner = SystemRunner;
        let err = runner.run("nonexistent_program_12345", &[]).unwrap_err();
        assert!(err.to_string().contains("Failed to execute"));
    }

    #[test]
    fn test_which_exists() {
        // `sh` should exist on any Unix system
        assert!(which(&SystemRunner, "sh").is_some());
    }

    #[test]
    fn test_which_not_exists() {
        assert!(which(&SystemRunner, "nonexistent_program_12345").is_none());
    }
}
