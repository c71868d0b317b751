// SPDX-License-Identifier: MIT OR Apache-2.0
//! Request/response envelopes for the control-plane REST API.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use gaffer_core::{ApprovalAction, Caps, Job, JobEvent, JobStatus, ModelProfile, RiskClass};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

/// Body of `POST /api/v1/jobs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobCreateRequest {
    /// Repository slug `owner/name`.
    pub repo: String,
    /// Issue number (≥ 1).
    pub issue_number: i64,
    /// Base branch override; the repo profile's default otherwise.
    #[serde(default)]
    pub base_branch: Option<String>,
    /// Risk class (default `code`).
    #[serde(default = "default_risk")]
    pub risk_class: RiskClass,
    /// Model profile (default `build`).
    #[serde(default = "default_model_profile")]
    pub model_profile: ModelProfile,
    /// Intake source label.
    #[serde(default = "default_created_by")]
    pub created_by: String,
    /// Allowed-path override; the repo profile's globs otherwise.
    #[serde(default)]
    pub allowed_paths: Vec<String>,
    /// Acceptance-command override; the repo profile's commands otherwise.
    #[serde(default)]
    pub acceptance_commands: Vec<String>,
    /// Caps override; the policy defaults otherwise.
    #[serde(default)]
    pub caps: Option<Caps>,
}

fn default_risk() -> RiskClass {
    RiskClass::Code
}

fn default_model_profile() -> ModelProfile {
    ModelProfile::Build
}

fn default_created_by() -> String {
    "operator".into()
}

/// Body of `POST /api/v1/intake/text`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextIntakeRequest {
    /// Repository slug `owner/name`.
    pub repo: String,
    /// Issue title.
    pub title: String,
    /// Issue body.
    #[serde(default)]
    pub body: String,
    /// Labels to apply (`agent-ready` is implicit and stripped).
    #[serde(default)]
    pub labels: Vec<String>,
    /// Risk class (default `code`).
    #[serde(default = "default_risk")]
    pub risk_class: RiskClass,
    /// Model profile (default `build`).
    #[serde(default = "default_model_profile")]
    pub model_profile: ModelProfile,
    /// Base branch override.
    #[serde(default)]
    pub base_branch: Option<String>,
    /// Allowed-path override.
    #[serde(default)]
    pub allowed_paths: Vec<String>,
    /// Acceptance-command override.
    #[serde(default)]
    pub acceptance_commands: Vec<String>,
    /// Caps override.
    #[serde(default)]
    pub caps: Option<Caps>,
    /// Intake source label.
    #[serde(default = "default_created_by")]
    pub created_by: String,
}

/// Body of `POST /api/v1/jobs/{id}/approve`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    /// Permission being granted.
    pub action: ApprovalAction,
    /// Operator identity.
    pub actor: String,
    /// Optional rationale.
    #[serde(default)]
    pub reason: Option<String>,
}

/// Body of `POST /api/v1/jobs/{id}/reject`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectRequest {
    /// Operator identity.
    pub actor: String,
    /// Required rationale; recorded as the failure reason.
    pub reason: String,
}

/// Response to the webhook endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookResult {
    /// Whether a job was created.
    pub accepted: bool,
    /// Human-readable outcome.
    pub message: String,
    /// The created job, when accepted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<Uuid>,
}

impl WebhookResult {
    /// A rejection with no state mutation.
    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            accepted: false,
            message: message.into(),
            job_id: None,
        }
    }

    /// An acceptance carrying the new job id.
    pub fn accepted(job_id: Uuid) -> Self {
        Self {
            accepted: true,
            message: "Job queued.".into(),
            job_id: Some(job_id),
        }
    }
}

/// Job representation returned by the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResponse {
    /// Job identifier.
    pub job_id: Uuid,
    /// Lifecycle status.
    pub status: JobStatus,
    /// Repository slug.
    pub repo: String,
    /// Issue number.
    pub issue_number: i64,
    /// Risk class.
    pub risk_class: RiskClass,
    /// Stage the job last entered.
    pub current_stage: Option<String>,
    /// Draft proposal URL, if completed in release mode.
    pub pr_url: Option<String>,
    /// Failure reason, if failed or rejected.
    pub failure_reason: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp.
    pub updated_at: DateTime<Utc>,
    /// Accumulated spend.
    pub cost_usd: f64,
}

impl From<&Job> for JobResponse {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            repo: job.repo.clone(),
            issue_number: job.issue_number,
            risk_class: job.risk_class,
            current_stage: job.current_stage.clone(),
            pr_url: job.pr_url.clone(),
            failure_reason: job.failure_reason.clone(),
            created_at: job.created_at,
            updated_at: job.updated_at,
            cost_usd: job.cost_usd,
        }
    }
}

/// One event in the `GET /api/v1/jobs/{id}` stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEventView {
    /// Stage the event belongs to.
    pub stage: String,
    /// Event discriminator.
    pub event_type: String,
    /// Human-readable description.
    pub message: String,
    /// Optional structured metadata.
    pub metadata: Option<serde_json::Value>,
    /// Timestamp.
    pub created_at: DateTime<Utc>,
}

impl From<&JobEvent> for JobEventView {
    fn from(event: &JobEvent) -> Self {
        Self {
            stage: event.stage.clone(),
            event_type: event.kind.as_str().to_string(),
            message: event.message.clone(),
            metadata: event
                .metadata
                .as_ref()
                .and_then(|m| serde_json::to_value(m).ok()),
            created_at: event.created_at,
        }
    }
}

/// Response to `GET /api/v1/jobs/{id}`: the job plus its ordered events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDetailResponse {
    /// The job.
    pub job: JobResponse,
    /// Events, oldest first.
    pub events: Vec<JobEventView>,
}

/// Structured API error with its HTTP status.
#[derive(Debug)]
pub struct ApiError {
    /// HTTP status to respond with.
    pub status: StatusCode,
    /// Human-readable message.
    pub message: String,
}

impl ApiError {
    /// An error with an explicit status.
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    /// 403 — denied repo or bad operator token.
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    /// 404 — unknown job or disabled repo profile.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    /// 409 — the requested transition conflicts with current state.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }

    /// 502 — an upstream forge call failed.
    pub fn bad_gateway(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, message)
    }

    /// 500 — anything else.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "detail": self.message }));
        (self.status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_create_request_defaults() {
        let req: JobCreateRequest =
            serde_json::from_str(r#"{"repo":"acme/repo","issue_number":42}"#).unwrap();
        assert_eq!(req.risk_class, RiskClass::Code);
        assert_eq!(req.model_profile, ModelProfile::Build);
        assert_eq!(req.created_by, "operator");
        assert!(req.caps.is_none());
        assert!(req.base_branch.is_none());
    }

    #[test]
    fn webhook_result_omits_absent_job_id() {
        let rejected = WebhookResult::rejected("nope");
        let value = serde_json::to_value(&rejected).unwrap();
        assert_eq!(value["accepted"], false);
        assert!(value.get("job_id").is_none());

        let accepted = WebhookResult::accepted(Uuid::nil());
        let value = serde_json::to_value(&accepted).unwrap();
        assert_eq!(value["accepted"], true);
        assert!(value.get("job_id").is_some());
    }

    #[test]
    fn approval_request_parses_action() {
        let req: ApprovalRequest =
            serde_json::from_str(r#"{"action":"destructive","actor":"op"}"#).unwrap();
        assert_eq!(req.action, ApprovalAction::Destructive);
        assert!(req.reason.is_none());
    }
}
