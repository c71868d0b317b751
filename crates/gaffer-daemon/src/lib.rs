// SPDX-License-Identifier: MIT OR Apache-2.0
//! gaffer-daemon
#![deny(unsafe_code)]
//!
//! The HTTP control plane: intake (webhook, operator create, text),
//! lifecycle operations (inspect, approve, reject), the cluster kill
//! switch, and metrics exposition.

/// Request/response envelopes and the API error type.
pub mod api;
/// Intake coordination rules.
pub mod intake;
/// Signature and token auth.
pub mod security;

use axum::extract::{Path as AxPath, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use gaffer_config::Settings;
use gaffer_core::taxonomy::classify_failure_reason;
use gaffer_core::{
    IncidentSeverity, IncidentStatus, JobEventKind, JobSpec, JobStatus,
};
use gaffer_integrations::ForgeClient;
use gaffer_policy::{PolicyProfile, RepoEntry};
use gaffer_queue::{JobEnvelope, QueueBackend, agents_enabled, set_kill_switch};
use gaffer_store::{JobStore, RepoProfileSeed, StoreError};
use gaffer_telemetry::{METRICS_CONTENT_TYPE, Metrics};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use uuid::Uuid;

use api::{
    ApiError, ApprovalRequest, JobCreateRequest, JobDetailResponse, JobEventView, JobResponse,
    RejectRequest, TextIntakeRequest, WebhookResult,
};

/// Shared state behind every handler.
pub struct AppState {
    /// Runtime settings.
    pub settings: Arc<Settings>,
    /// Job store.
    pub store: Arc<JobStore>,
    /// Compiled policy.
    pub policy: Arc<PolicyProfile>,
    /// Queue backend (also holds the kill switch).
    pub queue: Arc<dyn QueueBackend>,
    /// Metrics registry.
    pub metrics: Arc<Metrics>,
    /// Forge client (text intake creates issues in release mode).
    pub forge: Arc<dyn ForgeClient>,
}

impl AppState {
    /// Enqueue a job for dispatch unless the queue is disabled.
    async fn enqueue(&self, job_id: Uuid) {
        if self.settings.disable_queue {
            info!(job_id = %job_id, "queue disabled; job stays queued in the store");
            return;
        }
        if let Err(err) = self.queue.push(&JobEnvelope::new(job_id)).await {
            warn!(job_id = %job_id, error = %err, "failed to enqueue job");
        }
    }
}

/// Convert repo-profile config entries into store seeds.
pub fn profile_seeds(profiles: &BTreeMap<String, RepoEntry>) -> BTreeMap<String, RepoProfileSeed> {
    profiles
        .iter()
        .map(|(name, entry)| {
            (
                name.clone(),
                RepoProfileSeed {
                    enabled: entry.enabled,
                    base_branch: entry.base_branch.clone(),
                    allowed_paths: entry.allowed_paths.clone(),
                    acceptance_commands: entry.acceptance_commands.clone(),
                },
            )
        })
        .collect()
}

/// Build the control-plane router.
pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/api/v1/webhooks/github", post(github_webhook))
        .route("/api/v1/jobs", post(create_job))
        .route("/api/v1/intake/text", post(intake_text))
        .route("/api/v1/jobs/{id}", get(get_job))
        .route("/api/v1/jobs/{id}/approve", post(approve_job))
        .route("/api/v1/jobs/{id}/reject", post(reject_job))
        .route("/api/v1/control/kill-switch", post(kill_switch))
        .route("/api/v1/control/resume", post(resume))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn require_operator(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let provided = headers
        .get("x-operator-token")
        .and_then(|v| v.to_str().ok());
    if security::operator_token_valid(provided, &state.settings.operator_token) {
        Ok(())
    } else {
        Err(ApiError::forbidden("Invalid operator token."))
    }
}

fn store_error(err: StoreError) -> ApiError {
    match err {
        StoreError::JobNotFound(_) => ApiError::not_found("Job not found."),
        StoreError::InvalidTransition { from, to, .. } => ApiError::conflict(format!(
            "invalid status transition {} -> {}",
            from.as_str(),
            to.as_str()
        )),
        other => ApiError::internal(other.to_string()),
    }
}

async fn healthz() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn metrics(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let pending = state.store.pending_approval_count().map_err(store_error)?;
    state.metrics.pending_approvals.set(pending as f64);

    let failed = state.store.list_failed_jobs(5000).map_err(store_error)?;
    let mut by_category: BTreeMap<String, f64> = BTreeMap::new();
    let mut by_stage: BTreeMap<String, f64> = BTreeMap::new();
    for job in &failed {
        let category = classify_failure_reason(job.failure_reason.as_deref());
        *by_category.entry(category.as_str().to_string()).or_insert(0.0) += 1.0;
        let stage = job.current_stage.clone().unwrap_or_else(|| "unknown".into());
        *by_stage.entry(stage).or_insert(0.0) += 1.0;
    }
    state.metrics.job_failures_total.set(failed.len() as f64);
    state.metrics.job_failures_by_category.replace(by_category);
    state.metrics.job_failures_by_stage.replace(by_stage);

    let depth = if state.settings.disable_queue {
        state.store.queue_depth_estimate().map_err(store_error)? as usize
    } else {
        state.queue.size().await.unwrap_or(0)
    };
    state.metrics.queue_depth.set(depth as f64);

    let enabled = agents_enabled(state.queue.as_ref())
        .await
        .unwrap_or(true);
    state
        .metrics
        .agents_enabled
        .set(if enabled { 1.0 } else { 0.0 });

    Ok((
        StatusCode::OK,
        [("content-type", METRICS_CONTENT_TYPE)],
        state.metrics.render(),
    )
        .into_response())
}

async fn github_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<Json<WebhookResult>, ApiError> {
    let signature = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok());
    if !security::verify_webhook_signature(&body, signature, &state.settings.webhook_secret) {
        return Err(ApiError::new(
            StatusCode::UNAUTHORIZED,
            "Invalid webhook signature.",
        ));
    }

    if !agents_enabled(state.queue.as_ref()).await.unwrap_or(true) {
        return Ok(Json(WebhookResult::rejected("Kill switch active.")));
    }

    let event = headers
        .get("x-github-event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if event != "issues" {
        return Ok(Json(WebhookResult::rejected("Event ignored.")));
    }

    let Ok(hook) = serde_json::from_slice::<intake::IssuesWebhook>(&body) else {
        return Ok(Json(WebhookResult::rejected("Malformed payload.")));
    };

    if !hook.is_agent_ready() {
        return Ok(Json(WebhookResult::rejected("Missing agent-ready label.")));
    }

    let repo = hook.repository.full_name.clone();
    if !state.policy.repo_allowed(&repo) {
        return Ok(Json(WebhookResult::rejected(format!(
            "Repo not allowlisted: {repo}"
        ))));
    }

    let Some(issue_number) = hook.issue.as_ref().and_then(|i| i.number).filter(|n| *n >= 1)
    else {
        return Ok(Json(WebhookResult::rejected("Missing issue number.")));
    };

    let Some(profile) = state.store.get_repo_profile(&repo).map_err(store_error)? else {
        return Ok(Json(WebhookResult::rejected(format!("Repo disabled: {repo}"))));
    };
    if !profile.enabled {
        return Ok(Json(WebhookResult::rejected(format!("Repo disabled: {repo}"))));
    }

    if let Some(message) =
        intake::duplicate_rejection(&state.store, &repo, issue_number).map_err(store_error)?
    {
        return Ok(Json(WebhookResult::rejected(message)));
    }

    let risk = intake::detect_risk(&hook.label_names());
    let mut spec = JobSpec::new(repo, issue_number);
    spec.base_branch = profile.default_base_branch;
    spec.risk_class = risk;
    spec.allowed_paths = profile.allowed_paths;
    spec.acceptance_commands = profile.acceptance_commands;
    spec.caps = state.policy.default_caps;
    spec.requires_approval = state.policy.required_approvals(risk);
    spec.created_by = "github-webhook".into();

    let created = state.store.create_job(&spec).map_err(store_error)?;
    state.enqueue(created.id).await;
    state.metrics.jobs_created.inc("webhook");
    info!(job_id = %created.id, repo = %created.repo, "job created from webhook");
    Ok(Json(WebhookResult::accepted(created.id)))
}

async fn create_job(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<JobCreateRequest>,
) -> Result<Json<JobResponse>, ApiError> {
    require_operator(&state, &headers)?;

    if !state.policy.repo_allowed(&request.repo) {
        return Err(ApiError::forbidden("Repo not in allowlist."));
    }
    let Some(profile) = state
        .store
        .get_repo_profile(&request.repo)
        .map_err(store_error)?
        .filter(|p| p.enabled)
    else {
        return Err(ApiError::not_found("Repo profile not enabled."));
    };

    if request.issue_number < 1 {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "issue_number must be >= 1",
        ));
    }
    let caps = request.caps.unwrap_or(state.policy.default_caps);
    caps.validate()
        .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e.to_string()))?;

    let mut spec = JobSpec::new(request.repo.clone(), request.issue_number);
    spec.base_branch = request
        .base_branch
        .unwrap_or(profile.default_base_branch);
    spec.risk_class = request.risk_class;
    spec.model_profile = request.model_profile;
    spec.allowed_paths = if request.allowed_paths.is_empty() {
        profile.allowed_paths
    } else {
        request.allowed_paths
    };
    spec.acceptance_commands = if request.acceptance_commands.is_empty() {
        profile.acceptance_commands
    } else {
        request.acceptance_commands
    };
    spec.caps = caps;
    spec.requires_approval = state.policy.required_approvals(request.risk_class);
    spec.created_by = request.created_by;

    let created = state.store.create_job(&spec).map_err(store_error)?;
    state.enqueue(created.id).await;
    state.metrics.jobs_created.inc("manual");
    Ok(Json(JobResponse::from(&created)))
}

async fn intake_text(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<TextIntakeRequest>,
) -> Result<Json<JobResponse>, ApiError> {
    require_operator(&state, &headers)?;

    if !state.policy.repo_allowed(&request.repo) {
        return Err(ApiError::forbidden("Repo not in allowlist."));
    }

    let labels = intake::normalize_text_labels(&request.labels);
    let issue_number = if state.settings.is_release_mode() {
        let issue = state
            .forge
            .create_issue(&request.repo, &request.title, &request.body, &labels)
            .await
            .map_err(|e| ApiError::bad_gateway(e.to_string()))?;
        issue.number
    } else {
        // Synthetic issue id for fast-mode intake jobs that never reach the forge.
        (Uuid::new_v4().as_u128() % 2_000_000_000) as i64 + 1
    };

    let Some(profile) = state
        .store
        .get_repo_profile(&request.repo)
        .map_err(store_error)?
        .filter(|p| p.enabled)
    else {
        return Err(ApiError::not_found("Repo profile not enabled."));
    };

    let caps = request.caps.unwrap_or(state.policy.default_caps);
    caps.validate()
        .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e.to_string()))?;

    let mut spec = JobSpec::new(request.repo.clone(), issue_number);
    spec.base_branch = request
        .base_branch
        .unwrap_or(profile.default_base_branch);
    spec.risk_class = request.risk_class;
    spec.model_profile = request.model_profile;
    spec.allowed_paths = if request.allowed_paths.is_empty() {
        profile.allowed_paths
    } else {
        request.allowed_paths
    };
    spec.acceptance_commands = if request.acceptance_commands.is_empty() {
        profile.acceptance_commands
    } else {
        request.acceptance_commands
    };
    spec.caps = caps;
    spec.requires_approval = state.policy.required_approvals(request.risk_class);
    spec.created_by = request.created_by;

    let created = state.store.create_job(&spec).map_err(store_error)?;
    state.enqueue(created.id).await;
    let source = if state.settings.is_release_mode() {
        "text_intake_release"
    } else {
        "text_intake_fast"
    };
    state.metrics.jobs_created.inc(source);
    Ok(Json(JobResponse::from(&created)))
}

async fn get_job(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxPath(job_id): AxPath<Uuid>,
) -> Result<Json<JobDetailResponse>, ApiError> {
    require_operator(&state, &headers)?;

    let Some(job) = state.store.get_job(job_id).map_err(store_error)? else {
        return Err(ApiError::not_found("Job not found."));
    };
    let events = state.store.list_job_events(job_id).map_err(store_error)?;
    Ok(Json(JobDetailResponse {
        job: JobResponse::from(&job),
        events: events.iter().map(JobEventView::from).collect(),
    }))
}

async fn approve_job(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxPath(job_id): AxPath<Uuid>,
    Json(request): Json<ApprovalRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_operator(&state, &headers)?;

    let Some(job) = state.store.get_job(job_id).map_err(store_error)? else {
        return Err(ApiError::not_found("Job not found."));
    };
    state
        .store
        .add_approval(job_id, request.action, &request.actor, true, request.reason.as_deref())
        .map_err(store_error)?;
    state
        .store
        .add_job_event(
            job_id,
            "approval",
            JobEventKind::Approved,
            &format!("{} approved by {}.", request.action.as_str(), request.actor),
            None,
        )
        .map_err(store_error)?;

    if job.status == JobStatus::AwaitingApproval {
        state
            .store
            .update_job_status(job_id, JobStatus::Queued, Some("approval"), None, None)
            .map_err(store_error)?;
        state.enqueue(job_id).await;
    }
    Ok(Json(json!({ "status": "approved" })))
}

async fn reject_job(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxPath(job_id): AxPath<Uuid>,
    Json(request): Json<RejectRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_operator(&state, &headers)?;

    let Some(job) = state.store.get_job(job_id).map_err(store_error)? else {
        return Err(ApiError::not_found("Job not found."));
    };
    if !job.status.can_transition_to(JobStatus::Rejected) {
        return Err(ApiError::conflict(format!(
            "cannot reject a {} job",
            job.status.as_str()
        )));
    }
    state
        .store
        .add_job_event(
            job_id,
            "approval",
            JobEventKind::Rejected,
            &format!("Rejected by {}: {}", request.actor, request.reason),
            None,
        )
        .map_err(store_error)?;
    state
        .store
        .update_job_status(
            job_id,
            JobStatus::Rejected,
            Some("approval"),
            Some(&request.reason),
            None,
        )
        .map_err(store_error)?;
    Ok(Json(json!({ "status": "rejected" })))
}

async fn kill_switch(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_operator(&state, &headers)?;

    set_kill_switch(state.queue.as_ref(), false)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    state.metrics.agents_enabled.set(0.0);
    state
        .store
        .add_incident(
            "kill_switch",
            IncidentSeverity::Warning,
            IncidentStatus::Open,
            "Kill switch manually activated.",
        )
        .map_err(store_error)?;
    state.metrics.incidents.inc("kill_switch/warning");
    warn!("kill switch activated");
    Ok(Json(json!({ "status": "disabled" })))
}

async fn resume(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_operator(&state, &headers)?;

    set_kill_switch(state.queue.as_ref(), true)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    state.metrics.agents_enabled.set(1.0);
    state
        .store
        .add_incident(
            "kill_switch",
            IncidentSeverity::Info,
            IncidentStatus::Closed,
            "Execution resumed.",
        )
        .map_err(store_error)?;
    state.metrics.incidents.inc("kill_switch/info");
    info!("execution resumed");
    Ok(Json(json!({ "status": "enabled" })))
}
