// SPDX-License-Identifier: MIT OR Apache-2.0
//! Acceptance-command execution. Commands run inside a locked-down
//! container when docker is available, otherwise as a plain subprocess;
//! both paths share the same wall-clock bound.

use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;

use crate::error::StageError;

/// Upper bound on any single acceptance command, regardless of caps.
pub const MAX_COMMAND_SECONDS: u64 = 1200;

/// Effective timeout for a job's acceptance commands.
pub fn command_timeout(caps_max_minutes: u32) -> Duration {
    Duration::from_secs((u64::from(caps_max_minutes) * 60).min(MAX_COMMAND_SECONDS))
}

/// Outcome of one command.
#[derive(Debug)]
pub struct CommandOutcome {
    /// Process exit code (-1 when the process was killed).
    pub exit_code: i32,
    /// Interleaved stdout + stderr.
    pub output: String,
}

/// Run one acceptance command.
///
/// In fast mode nothing executes; a synthetic success line is recorded so
/// `test.log` still documents the command list.
pub async fn run_command(
    command: &str,
    timeout: Duration,
    cwd: &Path,
    fast_mode: bool,
    sandbox_image: &str,
) -> Result<CommandOutcome, StageError> {
    if fast_mode {
        return Ok(CommandOutcome {
            exit_code: 0,
            output: format!("FAST_MODE validated command: {command}\n"),
        });
    }

    let mut child = if which("docker").is_some() {
        let mut docker = Command::new("docker");
        docker
            .arg("run")
            .arg("--rm")
            .arg("--read-only")
            .args(["--network", "none"])
            .args(["--cpus", "4"])
            .args(["--memory", "8g"])
            .args(["--pids-limit", "512"])
            .arg("-v")
            .arg(format!("{}:/workspace", cwd.display()))
            .args(["-w", "/workspace"])
            .arg(sandbox_image)
            .args(["bash", "-lc", command]);
        docker
    } else {
        let mut shell = Command::new("bash");
        shell.args(["-lc", command]).current_dir(cwd);
        shell
    };

    let spawned = child
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| StageError::code(format!("ACCEPTANCE_COMMAND_SPAWN_FAILED: {e}")))?;

    let output = tokio::time::timeout(timeout, spawned.wait_with_output())
        .await
        .map_err(|_| StageError::code(format!("ACCEPTANCE_COMMAND_TIMEOUT: {command}")))?
        .map_err(|e| StageError::code(format!("ACCEPTANCE_COMMAND_SPAWN_FAILED: {e}")))?;

    let mut text = String::from_utf8_lossy(&output.stdout).to_string();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    Ok(CommandOutcome {
        exit_code: output.status.code().unwrap_or(-1),
        output: text,
    })
}

/// Locate a binary on PATH.
pub fn which(bin: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        let candidate = dir.join(bin);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_capped_at_twenty_minutes() {
        assert_eq!(command_timeout(5), Duration::from_secs(300));
        assert_eq!(command_timeout(45), Duration::from_secs(1200));
        assert_eq!(command_timeout(180), Duration::from_secs(1200));
    }

    #[tokio::test]
    async fn fast_mode_records_without_executing() {
        let tmp = tempfile::tempdir().unwrap();
        let outcome = run_command(
            "definitely-not-a-binary --flag",
            Duration::from_secs(5),
            tmp.path(),
            true,
            "python:3.12-slim",
        )
        .await
        .unwrap();
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(
            outcome.output,
            "FAST_MODE validated command: definitely-not-a-binary --flag\n"
        );
    }

    #[test]
    fn which_finds_common_binaries() {
        // `sh` exists on any platform these tests run on.
        assert!(which("sh").is_some());
        assert!(which("definitely-not-a-binary-xyz").is_none());
    }
}
