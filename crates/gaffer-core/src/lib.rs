// SPDX-License-Identifier: MIT OR Apache-2.0
//! gaffer-core
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The stable contract for Gaffer: jobs, their lifecycle, and the records
//! every other crate persists or exchanges.
//!
//! If you only take one dependency, take this one.

/// Failure-code normalization and classification.
pub mod taxonomy;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Artifact filenames guaranteed to exist in a job's artifact directory
/// before the first stage runs.
pub const DEFAULT_ARTIFACT_CONTRACT: &[&str] = &[
    "plan.md",
    "patch.diff",
    "test.log",
    "review.md",
    "cost.json",
    "run.jsonl",
];

/// Coarse safety tier for a job. Selects the required pre-execution
/// approvals via the policy approval matrix.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum RiskClass {
    /// Ordinary code changes.
    Code,
    /// Dependency updates.
    Deps,
    /// Infrastructure changes.
    Infra,
    /// Changes touching credentials or secret material.
    Secrets,
    /// Destructive operations.
    Destructive,
}

impl RiskClass {
    /// Stable wire string for this risk class.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Code => "code",
            Self::Deps => "deps",
            Self::Infra => "infra",
            Self::Secrets => "secrets",
            Self::Destructive => "destructive",
        }
    }

    /// Parse the wire string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "code" => Some(Self::Code),
            "deps" => Some(Self::Deps),
            "infra" => Some(Self::Infra),
            "secrets" => Some(Self::Secrets),
            "destructive" => Some(Self::Destructive),
            _ => None,
        }
    }
}

/// Which completion model tier a job runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ModelProfile {
    /// Cheap model for triage summaries.
    Triage,
    /// Main model for planning and implementation.
    Build,
    /// Model for review notes.
    Review,
}

impl ModelProfile {
    /// Stable wire string for this profile.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Triage => "triage",
            Self::Build => "build",
            Self::Review => "review",
        }
    }

    /// Parse the wire string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "triage" => Some(Self::Triage),
            "build" => Some(Self::Build),
            "review" => Some(Self::Review),
            _ => None,
        }
    }
}

/// A named permission token an operator records to unblock a job.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalAction {
    /// Permission to merge the eventual proposal.
    Merge,
    /// Permission for infrastructure-touching work.
    Infra,
    /// Permission for secret-touching work.
    Secrets,
    /// Permission for destructive work.
    Destructive,
}

impl ApprovalAction {
    /// Stable wire string for this action.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Merge => "merge",
            Self::Infra => "infra",
            Self::Secrets => "secrets",
            Self::Destructive => "destructive",
        }
    }

    /// Parse the wire string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "merge" => Some(Self::Merge),
            "infra" => Some(Self::Infra),
            "secrets" => Some(Self::Secrets),
            "destructive" => Some(Self::Destructive),
            _ => None,
        }
    }
}

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for a worker.
    Queued,
    /// A worker is executing stages.
    Running,
    /// Parked until an operator records the missing approval.
    AwaitingApproval,
    /// Finished; a draft proposal (if any) was produced.
    Completed,
    /// Terminated with a failure reason.
    Failed,
    /// Rejected by an operator.
    Rejected,
}

impl JobStatus {
    /// Returns `true` if this status represents a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Rejected)
    }

    /// Returns the set of statuses that are valid successors of `self`.
    pub fn valid_transitions(&self) -> &'static [JobStatus] {
        match self {
            Self::Queued => &[
                Self::Running,
                Self::AwaitingApproval,
                Self::Failed,
                Self::Rejected,
            ],
            Self::Running => &[Self::Completed, Self::Failed, Self::AwaitingApproval],
            Self::AwaitingApproval => &[Self::Queued, Self::Rejected],
            Self::Completed | Self::Failed | Self::Rejected => &[],
        }
    }

    /// Returns `true` if transitioning from `self` to `next` is valid.
    /// Same-status updates are always allowed (stage bookkeeping).
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        *self == next || self.valid_transitions().contains(&next)
    }

    /// Stable wire string for this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Rejected => "rejected",
        }
    }

    /// Parse the wire string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "awaiting_approval" => Some(Self::AwaitingApproval),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

/// One of the six pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Produce a triage summary.
    Triage,
    /// Produce an execution checklist.
    Plan,
    /// Produce the change set and patch.
    Execute,
    /// Run acceptance commands.
    Test,
    /// Produce review notes.
    Review,
    /// Prepare the draft proposal.
    Pr,
}

impl Stage {
    /// All stages in execution order.
    pub const ALL: [Stage; 6] = [
        Stage::Triage,
        Stage::Plan,
        Stage::Execute,
        Stage::Test,
        Stage::Review,
        Stage::Pr,
    ];

    /// Stable wire string for this stage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Triage => "triage",
            Self::Plan => "plan",
            Self::Execute => "execute",
            Self::Test => "test",
            Self::Review => "review",
            Self::Pr => "pr",
        }
    }
}

/// Hard per-job execution caps.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Caps {
    /// Wall-clock budget in minutes (1–180).
    pub max_minutes: u32,
    /// Iteration budget (1–100).
    pub max_iterations: u32,
    /// Spend budget in USD (0–50).
    pub max_usd: f64,
}

impl Default for Caps {
    fn default() -> Self {
        Self {
            max_minutes: 45,
            max_iterations: 8,
            max_usd: 3.0,
        }
    }
}

impl Caps {
    /// Check the documented ranges; out-of-range caps are an intake error.
    pub fn validate(&self) -> Result<(), InvalidCaps> {
        if !(1..=180).contains(&self.max_minutes) {
            return Err(InvalidCaps::MaxMinutes(self.max_minutes));
        }
        if !(1..=100).contains(&self.max_iterations) {
            return Err(InvalidCaps::MaxIterations(self.max_iterations));
        }
        if !(0.0..=50.0).contains(&self.max_usd) {
            return Err(InvalidCaps::MaxUsd(self.max_usd));
        }
        Ok(())
    }
}

/// A cap value fell outside its documented range.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum InvalidCaps {
    /// `max_minutes` must be in 1–180.
    #[error("INVALID_CAPS: max_minutes {0} outside 1..=180")]
    MaxMinutes(u32),
    /// `max_iterations` must be in 1–100.
    #[error("INVALID_CAPS: max_iterations {0} outside 1..=100")]
    MaxIterations(u32),
    /// `max_usd` must be in 0–50.
    #[error("INVALID_CAPS: max_usd {0} outside 0..=50")]
    MaxUsd(f64),
}

/// Everything needed to create a job. Defaults mirror the intake paths:
/// risk `code`, model `build`, caps from policy, `merge` approval tracked.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobSpec {
    /// Pre-assigned job identifier.
    pub job_id: Uuid,
    /// Repository slug `owner/name`.
    pub repo: String,
    /// Issue number (≥ 1).
    pub issue_number: i64,
    /// Branch the proposal targets.
    pub base_branch: String,
    /// Safety tier.
    pub risk_class: RiskClass,
    /// Completion model tier.
    pub model_profile: ModelProfile,
    /// Glob patterns the change set must stay inside.
    pub allowed_paths: Vec<String>,
    /// Shell commands that must exit zero in the test stage.
    pub acceptance_commands: Vec<String>,
    /// Execution caps.
    pub caps: Caps,
    /// Approval actions this job is expected to collect.
    pub requires_approval: Vec<ApprovalAction>,
    /// Artifact filenames guaranteed to exist before stage one.
    pub artifact_contract: Vec<String>,
    /// Intake source label.
    pub created_by: String,
    /// Creation timestamp (UTC).
    pub created_at: DateTime<Utc>,
}

impl JobSpec {
    /// A spec with every field at its intake default.
    pub fn new(repo: impl Into<String>, issue_number: i64) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            repo: repo.into(),
            issue_number,
            base_branch: "main".into(),
            risk_class: RiskClass::Code,
            model_profile: ModelProfile::Build,
            allowed_paths: Vec::new(),
            acceptance_commands: Vec::new(),
            caps: Caps::default(),
            requires_approval: vec![ApprovalAction::Merge],
            artifact_contract: DEFAULT_ARTIFACT_CONTRACT
                .iter()
                .map(|s| s.to_string())
                .collect(),
            created_by: "system".into(),
            created_at: Utc::now(),
        }
    }
}

/// A persisted job.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Job {
    /// Job identifier.
    pub id: Uuid,
    /// Repository slug `owner/name`.
    pub repo: String,
    /// Issue number.
    pub issue_number: i64,
    /// Branch the proposal targets.
    pub base_branch: String,
    /// Safety tier.
    pub risk_class: RiskClass,
    /// Lifecycle status.
    pub status: JobStatus,
    /// Completion model tier.
    pub model_profile: ModelProfile,
    /// Approval actions this job is expected to collect.
    pub requires_approval: Vec<ApprovalAction>,
    /// Glob patterns the change set must stay inside.
    pub allowed_paths: Vec<String>,
    /// Shell commands that must exit zero in the test stage.
    pub acceptance_commands: Vec<String>,
    /// Artifact filenames guaranteed to exist before stage one.
    pub artifact_contract: Vec<String>,
    /// Execution caps.
    pub caps: Caps,
    /// Intake source label.
    pub created_by: String,
    /// Creation timestamp (UTC).
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp (UTC).
    pub updated_at: DateTime<Utc>,
    /// Stage the job last entered, if any.
    pub current_stage: Option<String>,
    /// Verbatim failure code or error text, on failure.
    pub failure_reason: Option<String>,
    /// Draft proposal URL, on completion in release mode.
    pub pr_url: Option<String>,
    /// Accumulated spend; monotone non-decreasing, equals the ledger sum.
    pub cost_usd: f64,
}

impl Job {
    /// First eight hex characters of the id, used in branch names.
    pub fn short_id(&self) -> String {
        self.id.simple().to_string()[..8].to_string()
    }
}

/// Append-only lifecycle event, totally ordered within a job.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobEvent {
    /// Row identifier (store-assigned, ascending).
    pub id: i64,
    /// Owning job.
    pub job_id: Uuid,
    /// Stage the event belongs to (`enqueue`, `dispatch`, `approval`, or a
    /// pipeline stage).
    pub stage: String,
    /// Event discriminator.
    pub kind: JobEventKind,
    /// Human-readable description.
    pub message: String,
    /// Optional structured metadata.
    pub metadata: Option<BTreeMap<String, serde_json::Value>>,
    /// Timestamp (UTC).
    pub created_at: DateTime<Utc>,
}

/// Discriminator for [`JobEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobEventKind {
    /// The job was created.
    Created,
    /// A stage completed.
    Completed,
    /// A stage or the dispatch failed.
    Failed,
    /// The job parked awaiting an approval.
    Waiting,
    /// An operator recorded an approval.
    Approved,
    /// An operator rejected the job.
    Rejected,
}

impl JobEventKind {
    /// Stable wire string for this event kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Waiting => "waiting",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    /// Parse the wire string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(Self::Created),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "waiting" => Some(Self::Waiting),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

/// A recorded operator approval (or explicit denial).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Approval {
    /// Row identifier.
    pub id: i64,
    /// Owning job.
    pub job_id: Uuid,
    /// The permission being granted.
    pub action: ApprovalAction,
    /// Operator identity.
    pub actor: String,
    /// Whether the action was granted.
    pub approved: bool,
    /// Optional rationale.
    pub reason: Option<String>,
    /// Timestamp (UTC).
    pub created_at: DateTime<Utc>,
}

/// Outcome of a policy evaluation recorded in the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PolicyDecision {
    /// The checked action was permitted.
    Allow,
    /// The checked action was denied.
    Deny,
}

impl PolicyDecision {
    /// Stable wire string for this decision.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
        }
    }

    /// Parse the wire string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "allow" => Some(Self::Allow),
            "deny" => Some(Self::Deny),
            _ => None,
        }
    }
}

/// Append-only policy audit record.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PolicyAudit {
    /// Row identifier.
    pub id: i64,
    /// Owning job.
    pub job_id: Uuid,
    /// Allow or deny.
    pub decision: PolicyDecision,
    /// Identifier of the rule that fired.
    pub rule_id: String,
    /// Free-form detail (offending command, path list, URL).
    pub details: String,
    /// Timestamp (UTC).
    pub created_at: DateTime<Utc>,
}

/// One completion-model charge against a job.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CostEntry {
    /// Row identifier.
    pub id: i64,
    /// Owning job.
    pub job_id: Uuid,
    /// Model identifier as reported by the completion service.
    pub model: String,
    /// Prompt tokens consumed.
    pub prompt_tokens: i64,
    /// Completion tokens produced.
    pub completion_tokens: i64,
    /// Charge in USD (≥ 0).
    pub cost_usd: f64,
    /// Timestamp (UTC).
    pub created_at: DateTime<Utc>,
}

/// Severity of an operational incident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum IncidentSeverity {
    /// Informational.
    Info,
    /// Needs attention.
    Warning,
    /// Needs immediate attention.
    Critical,
}

impl IncidentSeverity {
    /// Stable wire string for this severity.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

/// Whether an incident is still open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    /// Unresolved.
    Open,
    /// Resolved.
    Closed,
}

impl IncidentStatus {
    /// Stable wire string for this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }
}

/// An operational incident (kill-switch flips, runaway spend, …).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Incident {
    /// Row identifier.
    pub id: i64,
    /// Incident type label (e.g. `kill_switch`).
    pub incident_type: String,
    /// Severity tier.
    pub severity: IncidentSeverity,
    /// Open or closed.
    pub status: IncidentStatus,
    /// Free-form detail.
    pub details: String,
    /// Timestamp (UTC).
    pub created_at: DateTime<Utc>,
    /// Resolution timestamp, once closed.
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Per-repository execution profile, upserted from config at bootstrap.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RepoProfile {
    /// Repository slug `owner/name` (primary key).
    pub repo: String,
    /// Whether jobs may run against this repository.
    pub enabled: bool,
    /// Default branch for proposals.
    pub default_base_branch: String,
    /// Default allowed-path globs.
    pub allowed_paths: Vec<String>,
    /// Default acceptance commands.
    pub acceptance_commands: Vec<String>,
    /// Timestamp (UTC).
    pub created_at: DateTime<Utc>,
    /// Last upsert timestamp (UTC).
    pub updated_at: DateTime<Utc>,
}
