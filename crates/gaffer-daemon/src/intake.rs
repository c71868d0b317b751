// SPDX-License-Identifier: MIT OR Apache-2.0
//! Intake coordination: typed webhook payloads, the agent-ready label rule,
//! label-driven risk detection, and duplicate suppression.

use chrono::{Duration, Utc};
use gaffer_core::{Job, JobStatus, RiskClass};
use gaffer_store::{JobStore, StoreError};
use serde::Deserialize;

/// Label that marks an issue as runnable by the agent.
pub const AGENT_READY_LABEL: &str = "agent-ready";

/// How recently a prior job for the same issue suppresses a new one.
pub const DUPLICATE_WINDOW_SECONDS: i64 = 120;

/// An `issues` webhook, reduced to the fields the coordinator branches on.
#[derive(Debug, Clone, Deserialize)]
pub struct IssuesWebhook {
    /// Webhook action (`opened`, `labeled`, …).
    #[serde(default)]
    pub action: String,
    /// Repository descriptor.
    #[serde(default)]
    pub repository: WebhookRepository,
    /// Issue descriptor.
    pub issue: Option<WebhookIssue>,
    /// The label added, on `labeled` actions.
    pub label: Option<WebhookLabel>,
}

/// Repository fields used by intake.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookRepository {
    /// Slug `owner/name`.
    #[serde(default)]
    pub full_name: String,
}

/// Issue fields used by intake.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookIssue {
    /// Issue number.
    pub number: Option<i64>,
    /// Labels currently on the issue.
    #[serde(default)]
    pub labels: Vec<WebhookLabel>,
}

/// A label descriptor.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookLabel {
    /// Label name.
    #[serde(default)]
    pub name: String,
}

impl IssuesWebhook {
    /// Lowercased names of the issue's labels.
    pub fn label_names(&self) -> Vec<String> {
        self.issue
            .as_ref()
            .map(|issue| {
                issue
                    .labels
                    .iter()
                    .map(|l| l.name.to_lowercase())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// A job is only accepted when the issue carries `agent-ready`, or the
    /// current `labeled` action added exactly that label.
    pub fn is_agent_ready(&self) -> bool {
        if self.action == "labeled" {
            return self
                .label
                .as_ref()
                .is_some_and(|l| l.name.to_lowercase() == AGENT_READY_LABEL);
        }
        self.label_names().iter().any(|l| l == AGENT_READY_LABEL)
    }
}

/// Risk detection from labels, highest tier first.
pub fn detect_risk(labels: &[String]) -> RiskClass {
    let has = |name: &str| labels.iter().any(|l| l == name);
    if has("destructive") {
        return RiskClass::Destructive;
    }
    if has("secrets") {
        return RiskClass::Secrets;
    }
    if has("infra") {
        return RiskClass::Infra;
    }
    if has("deps") || has("dependencies") || has("security") {
        return RiskClass::Deps;
    }
    RiskClass::Code
}

/// Deduplicate and sort text-intake labels, stripping `agent-ready`
/// case-insensitively (it is implicit on that path).
pub fn normalize_text_labels(labels: &[String]) -> Vec<String> {
    let mut out: Vec<String> = labels
        .iter()
        .filter(|l| l.to_lowercase() != AGENT_READY_LABEL)
        .cloned()
        .collect();
    out.sort();
    out.dedup();
    out
}

/// Why a webhook for `(repo, issue)` must be suppressed, if it must.
pub fn duplicate_rejection(
    store: &JobStore,
    repo: &str,
    issue_number: i64,
) -> Result<Option<String>, StoreError> {
    let Some(latest) = store.latest_job_for_issue(repo, issue_number)? else {
        return Ok(None);
    };
    Ok(duplicate_message(&latest))
}

fn duplicate_message(latest: &Job) -> Option<String> {
    if matches!(
        latest.status,
        JobStatus::Queued | JobStatus::Running | JobStatus::AwaitingApproval
    ) {
        return Some(format!("Job already in progress: {}", latest.id));
    }
    if latest.created_at >= Utc::now() - Duration::seconds(DUPLICATE_WINDOW_SECONDS) {
        return Some(format!("Duplicate webhook ignored: {}", latest.id));
    }
    None
}
