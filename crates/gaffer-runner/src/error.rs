// SPDX-License-Identifier: MIT OR Apache-2.0
//! Stage failure type. The string form is the verbatim `failure_reason`;
//! stable codes live at the front so the taxonomy can classify them.

use gaffer_integrations::{CompletionError, ForgeError};
use gaffer_queue::QueueError;
use gaffer_store::StoreError;

/// A stage-terminating failure carrying its wire form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageError {
    reason: String,
}

impl StageError {
    /// A failure with the given code/reason text.
    pub fn code(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    /// The verbatim reason recorded on the job.
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

impl std::fmt::Display for StageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.reason)
    }
}

impl std::error::Error for StageError {}

impl From<StoreError> for StageError {
    fn from(err: StoreError) -> Self {
        Self::code(err.to_string())
    }
}

impl From<QueueError> for StageError {
    fn from(err: QueueError) -> Self {
        Self::code(err.to_string())
    }
}

impl From<CompletionError> for StageError {
    fn from(err: CompletionError) -> Self {
        Self::code(err.to_string())
    }
}

impl From<ForgeError> for StageError {
    fn from(err: ForgeError) -> Self {
        Self::code(err.to_string())
    }
}

impl From<std::io::Error> for StageError {
    fn from(err: std::io::Error) -> Self {
        Self::code(format!("WORKSPACE_NOT_READY: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_verbatim() {
        let err = StageError::code("BLOCKED_COMMAND: rm -rf /");
        assert_eq!(err.to_string(), "BLOCKED_COMMAND: rm -rf /");
    }

    #[test]
    fn forge_errors_keep_their_code() {
        let err: StageError = ForgeError::InvalidRepoSlug("x".into()).into();
        assert!(err.reason().starts_with("INVALID_REPO_SLUG"));
    }

    #[test]
    fn io_errors_surface_as_workspace_state() {
        let err: StageError = std::io::Error::other("disk gone").into();
        assert!(err.reason().starts_with("WORKSPACE_NOT_READY"));
    }
}
