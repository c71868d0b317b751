// SPDX-License-Identifier: MIT OR Apache-2.0
//! gaffer-runner
#![deny(unsafe_code)]
//!
//! The dispatch path: a queued job arrives here and leaves in a terminal
//! state or parked awaiting approval. Stages run in a fixed order inside an
//! exclusive temporary workspace; every cost-incurring boundary re-checks
//! the spend caps; every exit path deletes the workspace and leaves a
//! self-describing `run.jsonl` behind.

/// Artifact-tree helpers (contract files, run log).
pub mod artifacts;
mod error;
/// Pre-execution approval gate.
pub mod gate;
/// Shell-out git helpers for the real execute/propose path.
pub mod gitops;
/// Sandboxed acceptance-command execution.
pub mod sandbox;
/// Spend governor.
pub mod spend;

mod stages;

pub use error::StageError;

use gaffer_config::Settings;
use gaffer_core::{Job, JobEventKind, JobStatus, Stage};
use gaffer_integrations::{CompletionClient, ForgeClient};
use gaffer_policy::PolicyProfile;
use gaffer_queue::{QueueBackend, agents_enabled};
use gaffer_store::JobStore;
use gaffer_telemetry::Metrics;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};
use uuid::Uuid;

/// Everything a stage needs, threaded explicitly instead of captured in
/// closures over mutable locals.
pub(crate) struct StageContext {
    pub(crate) job: Job,
    pub(crate) artifact_dir: PathBuf,
    pub(crate) run_log: PathBuf,
    pub(crate) workspace: PathBuf,
    /// Checkout under the workspace, once the real execute stage clones.
    pub(crate) repo_dir: Option<PathBuf>,
    /// Proposal branch name, once created.
    pub(crate) branch: Option<String>,
}

/// Processes one job per call, to completion. Shared by every worker task.
pub struct JobProcessor {
    store: Arc<JobStore>,
    policy: Arc<PolicyProfile>,
    settings: Arc<Settings>,
    metrics: Arc<Metrics>,
    queue: Arc<dyn QueueBackend>,
    llm: Arc<dyn CompletionClient>,
    forge: Arc<dyn ForgeClient>,
}

impl JobProcessor {
    /// Assemble a processor over shared components.
    pub fn new(
        store: Arc<JobStore>,
        policy: Arc<PolicyProfile>,
        settings: Arc<Settings>,
        metrics: Arc<Metrics>,
        queue: Arc<dyn QueueBackend>,
        llm: Arc<dyn CompletionClient>,
        forge: Arc<dyn ForgeClient>,
    ) -> Self {
        Self {
            store,
            policy,
            settings,
            metrics,
            queue,
            llm,
            forge,
        }
    }

    pub(crate) fn store(&self) -> &JobStore {
        &self.store
    }

    pub(crate) fn policy(&self) -> &PolicyProfile {
        &self.policy
    }

    pub(crate) fn settings(&self) -> &Settings {
        &self.settings
    }

    pub(crate) fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub(crate) fn llm(&self) -> &dyn CompletionClient {
        self.llm.as_ref()
    }

    pub(crate) fn forge(&self) -> &dyn ForgeClient {
        self.forge.as_ref()
    }

    /// Dispatch one job. Idempotent: terminal jobs and duplicate deliveries
    /// return without side effects.
    pub async fn process(&self, job_id: Uuid) -> anyhow::Result<()> {
        let Some(job) = self.store.get_job(job_id)? else {
            error!(job_id = %job_id, "job not found");
            return Ok(());
        };

        let artifact_dir =
            artifacts::ensure_job_artifact_dir(&self.settings.artifact_root, &job_id.to_string())?;
        artifacts::ensure_contract(&artifact_dir, &job.artifact_contract)?;
        let run_log = artifact_dir.join("run.jsonl");

        artifacts::log_run_event(
            &run_log,
            "job_start",
            json!({ "job_id": job_id, "status": job.status.as_str() }),
        );

        if job.status.is_terminal() {
            return Ok(());
        }

        if !agents_enabled(self.queue.as_ref()).await? {
            if job.status.can_transition_to(JobStatus::Failed) {
                // Event first: nothing may land after the terminal updated_at.
                self.store.add_job_event(
                    job_id,
                    "dispatch",
                    JobEventKind::Failed,
                    "Kill switch active.",
                    None,
                )?;
                self.store.update_job_status(
                    job_id,
                    JobStatus::Failed,
                    Some("dispatch"),
                    Some("KILL_SWITCH_ACTIVE"),
                    None,
                )?;
                self.metrics.jobs_completed.inc(JobStatus::Failed.as_str());
                artifacts::log_run_event(
                    &run_log,
                    "job_failed",
                    json!({ "error": "KILL_SWITCH_ACTIVE" }),
                );
            }
            return Ok(());
        }

        if !gate::pregate_satisfied(&self.store, job_id, job.risk_class)? {
            self.store.update_job_status(
                job_id,
                JobStatus::AwaitingApproval,
                Some("approval"),
                None,
                None,
            )?;
            self.store.add_job_event(
                job_id,
                "approval",
                JobEventKind::Waiting,
                &format!(
                    "Approval required for risk class {}.",
                    job.risk_class.as_str()
                ),
                None,
            )?;
            artifacts::log_run_event(&run_log, "job_waiting_approval", json!({}));
            return Ok(());
        }

        // Exclusive per-job workspace; the TempDir guard deletes it on every
        // exit path below, including panics and early returns.
        let workspace = tempfile::Builder::new()
            .prefix(&format!("gaffer-job-{job_id}-"))
            .tempdir()?;

        let mut ctx = StageContext {
            job,
            artifact_dir,
            run_log: run_log.clone(),
            workspace: workspace.path().to_path_buf(),
            repo_dir: None,
            branch: None,
        };

        if let Err(stage_err) = self.run_pipeline(&mut ctx).await {
            self.handle_failure(job_id, &run_log, stage_err)?;
        }
        Ok(())
    }

    async fn run_pipeline(&self, ctx: &mut StageContext) -> Result<(), StageError> {
        let job_id = ctx.job.id;

        self.enter_stage(ctx, Stage::Triage)?;
        self.timed(Stage::Triage, stages::triage(self, ctx)).await?;
        spend::check_spend_caps(&self.store, &self.settings, &self.metrics, job_id)?;

        self.enter_stage(ctx, Stage::Plan)?;
        self.timed(Stage::Plan, stages::plan(self, ctx)).await?;
        spend::check_spend_caps(&self.store, &self.settings, &self.metrics, job_id)?;

        self.enter_stage(ctx, Stage::Execute)?;
        self.timed(Stage::Execute, stages::execute(self, ctx)).await?;
        if let Some(fresh) = self.store.get_job(job_id)? {
            if fresh.status == JobStatus::AwaitingApproval {
                artifacts::log_run_event(&ctx.run_log, "job_waiting_approval", json!({}));
                return Ok(());
            }
        }
        spend::check_spend_caps(&self.store, &self.settings, &self.metrics, job_id)?;

        self.enter_stage(ctx, Stage::Test)?;
        self.timed(Stage::Test, stages::test(self, ctx)).await?;

        self.enter_stage(ctx, Stage::Review)?;
        self.timed(Stage::Review, stages::review(self, ctx)).await?;
        spend::check_spend_caps(&self.store, &self.settings, &self.metrics, job_id)?;

        self.enter_stage(ctx, Stage::Pr)?;
        self.timed(Stage::Pr, stages::propose(self, ctx)).await?;

        self.metrics
            .jobs_completed
            .inc(JobStatus::Completed.as_str());
        artifacts::log_run_event(&ctx.run_log, "job_completed", json!({}));
        info!(job_id = %job_id, "job completed");
        Ok(())
    }

    fn enter_stage(&self, ctx: &StageContext, stage: Stage) -> Result<(), StageError> {
        self.store.update_job_status(
            ctx.job.id,
            JobStatus::Running,
            Some(stage.as_str()),
            None,
            None,
        )?;
        artifacts::log_run_event(
            &ctx.run_log,
            "stage_start",
            json!({ "stage": stage.as_str() }),
        );
        Ok(())
    }

    async fn timed<F>(&self, stage: Stage, fut: F) -> Result<(), StageError>
    where
        F: std::future::Future<Output = Result<(), StageError>>,
    {
        let start = Instant::now();
        let result = fut.await;
        self.metrics
            .stage_duration
            .observe(stage.as_str(), start.elapsed().as_secs_f64());
        result
    }

    /// A job already moved to awaiting_approval stays there; anything else
    /// transitions to failed with the reason recorded verbatim.
    fn handle_failure(
        &self,
        job_id: Uuid,
        run_log: &Path,
        stage_err: StageError,
    ) -> anyhow::Result<()> {
        let message = stage_err.reason().to_string();
        error!(job_id = %job_id, error = %message, "job failed");

        match self.store.get_job(job_id)? {
            Some(job) if job.status == JobStatus::AwaitingApproval => {
                artifacts::log_run_event(run_log, "job_waiting_approval", json!({}));
            }
            Some(job) if job.status.is_terminal() => {
                artifacts::log_run_event(run_log, "job_failed", json!({ "error": message }));
            }
            Some(job) => {
                let stage = job
                    .current_stage
                    .clone()
                    .unwrap_or_else(|| "unknown".to_string());
                // Event first: nothing may land after the terminal updated_at.
                self.store
                    .add_job_event(job_id, &stage, JobEventKind::Failed, &message, None)?;
                self.store.update_job_status(
                    job_id,
                    JobStatus::Failed,
                    Some(stage.as_str()),
                    Some(&message),
                    None,
                )?;
                self.metrics.jobs_completed.inc(JobStatus::Failed.as_str());
                artifacts::log_run_event(run_log, "job_failed", json!({ "error": message }));
            }
            None => {
                artifacts::log_run_event(run_log, "job_failed", json!({ "error": message }));
            }
        }
        Ok(())
    }
}
