// SPDX-License-Identifier: MIT OR Apache-2.0
//! Failure taxonomy: normalize raw failure strings to a stable code and map
//! codes to a closed set of categories.
//!
//! The wire/log form of a failure stays the verbatim `failure_reason`
//! string; these helpers only ever derive from it.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Closed set of failure categories surfaced in metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    /// A spend cap was breached.
    BudgetCap,
    /// A blocked command was attempted.
    CommandPolicy,
    /// A non-allowlisted domain was referenced.
    DomainPolicy,
    /// A change escaped the allowed-path globs.
    PathPolicy,
    /// A required approval was missing.
    ApprovalGate,
    /// A secret pattern was detected in generated content.
    SecretGuard,
    /// An acceptance command exited non-zero.
    AcceptanceTest,
    /// A git operation failed.
    GitFailure,
    /// A forge API call failed.
    GithubApi,
    /// The kill switch refused the dispatch.
    SafetyControl,
    /// The pipeline produced nothing to act on.
    ExecutionLogic,
    /// The runtime found itself in an unusable state.
    RuntimeState,
    /// Input validation failed.
    InputValidation,
    /// Anything else.
    RuntimeError,
}

impl FailureCategory {
    /// Stable snake_case label used in metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BudgetCap => "budget_cap",
            Self::CommandPolicy => "command_policy",
            Self::DomainPolicy => "domain_policy",
            Self::PathPolicy => "path_policy",
            Self::ApprovalGate => "approval_gate",
            Self::SecretGuard => "secret_guard",
            Self::AcceptanceTest => "acceptance_test",
            Self::GitFailure => "git_failure",
            Self::GithubApi => "github_api",
            Self::SafetyControl => "safety_control",
            Self::ExecutionLogic => "execution_logic",
            Self::RuntimeState => "runtime_state",
            Self::InputValidation => "input_validation",
            Self::RuntimeError => "runtime_error",
        }
    }
}

/// Normalize a raw failure reason to its stable code: trim, take everything
/// before the first `:`, uppercase. Absent or blank input yields `UNKNOWN`.
pub fn normalize_failure_code(reason: Option<&str>) -> String {
    let raw = match reason {
        Some(r) => r.trim(),
        None => return "UNKNOWN".into(),
    };
    if raw.is_empty() {
        return "UNKNOWN".into();
    }
    let head = raw.split(':').next().unwrap_or(raw).trim();
    head.to_ascii_uppercase()
}

/// Map a raw failure reason to its category, first prefix/suffix match wins.
pub fn classify_failure_reason(reason: Option<&str>) -> FailureCategory {
    let code = normalize_failure_code(reason);

    if code.starts_with("CAP_") {
        return FailureCategory::BudgetCap;
    }
    if code.starts_with("BLOCKED_COMMAND") {
        return FailureCategory::CommandPolicy;
    }
    if code.starts_with("DOMAIN_NOT_ALLOWLISTED") {
        return FailureCategory::DomainPolicy;
    }
    if code.starts_with("ALLOWED_PATHS_VIOLATION") {
        return FailureCategory::PathPolicy;
    }
    if code.ends_with("APPROVAL_REQUIRED") {
        return FailureCategory::ApprovalGate;
    }
    if code.starts_with("SECRET_PATTERN_DETECTED") {
        return FailureCategory::SecretGuard;
    }
    if code.starts_with("ACCEPTANCE_COMMAND_FAILED") {
        return FailureCategory::AcceptanceTest;
    }
    if code.starts_with("GIT_") {
        return FailureCategory::GitFailure;
    }
    if code.starts_with("GITHUB_") {
        return FailureCategory::GithubApi;
    }
    if code.starts_with("KILL_SWITCH_ACTIVE") {
        return FailureCategory::SafetyControl;
    }
    if code.starts_with("NO_") {
        return FailureCategory::ExecutionLogic;
    }
    if code.starts_with("WORKSPACE_NOT_READY") {
        return FailureCategory::RuntimeState;
    }
    if code.starts_with("INVALID_") {
        return FailureCategory::InputValidation;
    }
    FailureCategory::RuntimeError
}
