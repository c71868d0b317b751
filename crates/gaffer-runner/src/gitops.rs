// SPDX-License-Identifier: MIT OR Apache-2.0
//! Git helpers for the real execute/propose path. Everything shells out to
//! the `git` binary; failures carry stable `GIT_*` codes with the captured
//! stderr appended.

use std::path::Path;
use tokio::process::Command;

use crate::error::StageError;

async fn run_git(cwd: &Path, args: &[&str], code: &str) -> Result<String, StageError> {
    let output = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .output()
        .await
        .map_err(|e| StageError::code(format!("{code}: {e}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(StageError::code(format!("{code}: {}", stderr.trim())));
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Shallow-clone `url` at `branch` into `dest`.
pub async fn clone_branch(url: &str, branch: &str, dest: &Path) -> Result<(), StageError> {
    let parent = dest.parent().unwrap_or(Path::new("."));
    let dest_str = dest.to_string_lossy().to_string();
    run_git(
        parent,
        &["clone", "--depth", "1", "--branch", branch, url, &dest_str],
        "GIT_CLONE_FAILED",
    )
    .await
    .map(|_| ())
}

/// Create and switch to a new branch.
pub async fn create_branch(repo: &Path, name: &str) -> Result<(), StageError> {
    run_git(repo, &["checkout", "-b", name], "GIT_BRANCH_FAILED")
        .await
        .map(|_| ())
}

/// Record an intent-to-add so untracked files show up in the diff.
pub async fn intent_to_add(repo: &Path, path: &str) -> Result<(), StageError> {
    run_git(repo, &["add", "--intent-to-add", path], "GIT_ADD_FAILED")
        .await
        .map(|_| ())
}

/// Unified working-tree diff.
pub async fn diff(repo: &Path) -> Result<String, StageError> {
    run_git(repo, &["diff", "--no-color"], "GIT_DIFF_FAILED").await
}

/// Set the committer identity for this checkout.
pub async fn configure_identity(repo: &Path, name: &str, email: &str) -> Result<(), StageError> {
    run_git(repo, &["config", "user.name", name], "GIT_CONFIG_FAILED").await?;
    run_git(repo, &["config", "user.email", email], "GIT_CONFIG_FAILED")
        .await
        .map(|_| ())
}

/// Stage the whole working tree.
pub async fn add_all(repo: &Path) -> Result<(), StageError> {
    run_git(repo, &["add", "-A"], "GIT_ADD_FAILED").await.map(|_| ())
}

/// Whether anything is staged or dirty.
pub async fn has_changes(repo: &Path) -> Result<bool, StageError> {
    let status = run_git(repo, &["status", "--porcelain"], "GIT_STATUS_FAILED").await?;
    Ok(!status.trim().is_empty())
}

/// Commit staged changes.
pub async fn commit(repo: &Path, message: &str) -> Result<(), StageError> {
    run_git(repo, &["commit", "-m", message], "GIT_COMMIT_FAILED")
        .await
        .map(|_| ())
}

/// Push a branch to origin.
pub async fn push_branch(repo: &Path, branch: &str) -> Result<(), StageError> {
    run_git(repo, &["push", "origin", branch], "GIT_PUSH_FAILED")
        .await
        .map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn init_repo(dir: &Path) {
        run_git(dir, &["init", "-q"], "GIT_INIT_FAILED").await.unwrap();
        configure_identity(dir, "tester", "tester@local").await.unwrap();
    }

    #[tokio::test]
    async fn diff_reflects_intent_to_add() {
        let tmp = tempfile::tempdir().unwrap();
        init_repo(tmp.path()).await;
        std::fs::write(tmp.path().join("seed.txt"), "seed\n").unwrap();
        add_all(tmp.path()).await.unwrap();
        commit(tmp.path(), "seed").await.unwrap();

        std::fs::write(tmp.path().join("notes.md"), "new file\n").unwrap();
        intent_to_add(tmp.path(), "notes.md").await.unwrap();
        let patch = diff(tmp.path()).await.unwrap();
        assert!(patch.contains("notes.md"));
        assert!(patch.contains("+new file"));
    }

    #[tokio::test]
    async fn has_changes_tracks_working_tree() {
        let tmp = tempfile::tempdir().unwrap();
        init_repo(tmp.path()).await;
        std::fs::write(tmp.path().join("a.txt"), "a\n").unwrap();
        add_all(tmp.path()).await.unwrap();
        commit(tmp.path(), "first").await.unwrap();
        assert!(!has_changes(tmp.path()).await.unwrap());

        std::fs::write(tmp.path().join("b.txt"), "b\n").unwrap();
        assert!(has_changes(tmp.path()).await.unwrap());
    }

    #[tokio::test]
    async fn failures_carry_stable_codes() {
        let tmp = tempfile::tempdir().unwrap();
        // Not a repository: status fails with the GIT_STATUS_FAILED code.
        let err = has_changes(tmp.path()).await.unwrap_err();
        assert!(err.reason().starts_with("GIT_STATUS_FAILED"));
    }

    #[tokio::test]
    async fn branch_creation() {
        let tmp = tempfile::tempdir().unwrap();
        init_repo(tmp.path()).await;
        std::fs::write(tmp.path().join("a.txt"), "a\n").unwrap();
        add_all(tmp.path()).await.unwrap();
        commit(tmp.path(), "first").await.unwrap();
        create_branch(tmp.path(), "codex-home/job-deadbeef-1700000000")
            .await
            .unwrap();
        let head = run_git(tmp.path(), &["branch", "--show-current"], "GIT_BRANCH_FAILED")
            .await
            .unwrap();
        assert_eq!(head.trim(), "codex-home/job-deadbeef-1700000000");
    }
}
