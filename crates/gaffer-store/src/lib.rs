// SPDX-License-Identifier: MIT OR Apache-2.0
//! gaffer-store
#![deny(unsafe_code)]
//!
//! Durable persistence for jobs, events, approvals, policy audits, the cost
//! ledger, incidents, and repo profiles, on embedded SQLite.
//!
//! Every public method is one transaction: it either commits all of its
//! writes or surfaces an error and writes nothing. Status changes are
//! validated against the lifecycle DAG before they land.

use chrono::{DateTime, NaiveDate, Utc};
use gaffer_core::{
    Approval, ApprovalAction, Caps, CostEntry, Incident, IncidentSeverity, IncidentStatus, Job,
    JobEvent, JobEventKind, JobSpec, JobStatus, ModelProfile, PolicyAudit, PolicyDecision,
    RepoProfile, RiskClass,
};
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

/// Errors surfaced by the store. The stage runner treats all of them as
/// job-fatal.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The database could not be opened.
    #[error("failed to open database {path}: {source}")]
    Open {
        /// Resolved filesystem location.
        path: String,
        /// Underlying driver error.
        source: rusqlite::Error,
    },

    /// An SQL statement failed.
    #[error("database error: {0}")]
    Sql(#[from] rusqlite::Error),

    /// A row referenced a job that does not exist.
    #[error("JOB_NOT_FOUND: {0}")]
    JobNotFound(Uuid),

    /// A status change violated the lifecycle DAG.
    #[error("invalid status transition {from:?} -> {to:?} for job {job_id}")]
    InvalidTransition {
        /// Job being mutated.
        job_id: Uuid,
        /// Status on disk.
        from: JobStatus,
        /// Requested status.
        to: JobStatus,
    },

    /// A persisted column failed to decode.
    #[error("corrupt column {column}: {reason}")]
    Corrupt {
        /// Column name.
        column: &'static str,
        /// Decode failure detail.
        reason: String,
    },
}

type Result<T> = std::result::Result<T, StoreError>;

/// Seed values for a repo-profile upsert (decoupled from the config crate).
#[derive(Debug, Clone)]
pub struct RepoProfileSeed {
    /// Whether jobs may run against this repository.
    pub enabled: bool,
    /// Default branch proposals target.
    pub base_branch: String,
    /// Default allowed-path globs.
    pub allowed_paths: Vec<String>,
    /// Default acceptance commands.
    pub acceptance_commands: Vec<String>,
}

/// Handle to the SQLite-backed job store. Cheap to share behind an `Arc`;
/// each process opens its own handle and SQLite serializes across them.
pub struct JobStore {
    conn: Mutex<Connection>,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    job_id              TEXT PRIMARY KEY,
    repo                TEXT NOT NULL,
    issue_number        INTEGER NOT NULL,
    base_branch         TEXT NOT NULL DEFAULT 'main',
    risk_class          TEXT NOT NULL,
    status              TEXT NOT NULL DEFAULT 'queued',
    model_profile       TEXT NOT NULL DEFAULT 'build',
    requires_approval   TEXT NOT NULL,
    allowed_paths       TEXT NOT NULL,
    acceptance_commands TEXT NOT NULL,
    artifact_contract   TEXT NOT NULL,
    caps_max_minutes    INTEGER NOT NULL,
    caps_max_iterations INTEGER NOT NULL,
    caps_max_usd        REAL NOT NULL,
    created_by          TEXT NOT NULL,
    created_at          TEXT NOT NULL,
    updated_at          TEXT NOT NULL,
    current_stage       TEXT,
    failure_reason      TEXT,
    pr_url              TEXT,
    cost_usd            REAL NOT NULL DEFAULT 0.0
);
CREATE INDEX IF NOT EXISTS idx_jobs_repo_issue ON jobs (repo, issue_number, created_at);
CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs (status);

CREATE TABLE IF NOT EXISTS job_events (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id     TEXT NOT NULL REFERENCES jobs (job_id) ON DELETE CASCADE,
    stage      TEXT NOT NULL,
    event_type TEXT NOT NULL,
    message    TEXT NOT NULL,
    metadata   TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_job_events_job ON job_events (job_id, created_at);

CREATE TABLE IF NOT EXISTS approvals (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id     TEXT NOT NULL REFERENCES jobs (job_id) ON DELETE CASCADE,
    action     TEXT NOT NULL,
    approved   INTEGER NOT NULL DEFAULT 1,
    actor      TEXT NOT NULL,
    reason     TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_approvals_job ON approvals (job_id, action);

CREATE TABLE IF NOT EXISTS policy_audit (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id     TEXT NOT NULL REFERENCES jobs (job_id) ON DELETE CASCADE,
    decision   TEXT NOT NULL,
    rule_id    TEXT NOT NULL,
    details    TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS cost_ledger (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id            TEXT NOT NULL REFERENCES jobs (job_id) ON DELETE CASCADE,
    model             TEXT NOT NULL,
    prompt_tokens     INTEGER NOT NULL DEFAULT 0,
    completion_tokens INTEGER NOT NULL DEFAULT 0,
    cost_usd          REAL NOT NULL DEFAULT 0.0,
    created_at        TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_cost_ledger_job ON cost_ledger (job_id);
CREATE INDEX IF NOT EXISTS idx_cost_ledger_day ON cost_ledger (created_at);

CREATE TABLE IF NOT EXISTS incidents (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    incident_type TEXT NOT NULL,
    severity      TEXT NOT NULL,
    status        TEXT NOT NULL,
    details       TEXT NOT NULL,
    created_at    TEXT NOT NULL,
    resolved_at   TEXT
);

CREATE TABLE IF NOT EXISTS repo_profiles (
    repo                TEXT PRIMARY KEY,
    enabled             INTEGER NOT NULL DEFAULT 1,
    default_base_branch TEXT NOT NULL DEFAULT 'main',
    allowed_paths       TEXT NOT NULL,
    acceptance_commands TEXT NOT NULL,
    created_at          TEXT NOT NULL,
    updated_at          TEXT NOT NULL
);
"#;

impl JobStore {
    /// Open (and create if absent) the database behind `database_url`.
    ///
    /// Accepts a filesystem path, a `sqlite://`/`sqlite:///` URL, or
    /// `:memory:`.
    pub fn open(database_url: &str) -> Result<Self> {
        let location = resolve_location(database_url);
        let conn = if location == ":memory:" {
            Connection::open_in_memory()
        } else {
            if let Some(parent) = Path::new(&location).parent() {
                if !parent.as_os_str().is_empty() {
                    let _ = std::fs::create_dir_all(parent);
                }
            }
            Connection::open(&location)
        }
        .map_err(|source| StoreError::Open {
            path: location.clone(),
            source,
        })?;

        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create the schema. Safe to run from multiple processes at once:
    /// every statement is create-if-absent.
    pub fn init_schema(&self) -> Result<()> {
        let conn = self.lock();
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("store lock poisoned")
    }

    /// Persist a new job and its `created` event in one transaction.
    pub fn create_job(&self, spec: &JobSpec) -> Result<Job> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let created_at = ts(spec.created_at);
        tx.execute(
            "INSERT INTO jobs (job_id, repo, issue_number, base_branch, risk_class, status,
                               model_profile, requires_approval, allowed_paths,
                               acceptance_commands, artifact_contract, caps_max_minutes,
                               caps_max_iterations, caps_max_usd, created_by, created_at,
                               updated_at, cost_usd)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?16, 0.0)",
            params![
                spec.job_id.to_string(),
                spec.repo,
                spec.issue_number,
                spec.base_branch,
                spec.risk_class.as_str(),
                JobStatus::Queued.as_str(),
                spec.model_profile.as_str(),
                encode_actions(&spec.requires_approval),
                encode_strings(&spec.allowed_paths),
                encode_strings(&spec.acceptance_commands),
                encode_strings(&spec.artifact_contract),
                spec.caps.max_minutes,
                spec.caps.max_iterations,
                spec.caps.max_usd,
                spec.created_by,
                created_at,
            ],
        )?;
        insert_event(
            &tx,
            spec.job_id,
            "enqueue",
            JobEventKind::Created,
            "Job created and queued.",
            Some(BTreeMap::from([(
                "source".to_string(),
                serde_json::Value::String(spec.created_by.clone()),
            )])),
        )?;
        let job = read_job(&tx, spec.job_id)?.ok_or(StoreError::JobNotFound(spec.job_id))?;
        tx.commit()?;
        Ok(job)
    }

    /// Fetch a job by id.
    pub fn get_job(&self, job_id: Uuid) -> Result<Option<Job>> {
        let conn = self.lock();
        read_job(&conn, job_id)
    }

    /// The most recently created job for `(repo, issue_number)`, if any.
    pub fn latest_job_for_issue(&self, repo: &str, issue_number: i64) -> Result<Option<Job>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM jobs WHERE repo = ?1 AND issue_number = ?2
             ORDER BY created_at DESC LIMIT 1",
        )?;
        stmt.query_row(params![repo, issue_number], job_from_row)
            .optional()
            .map_err(Into::into)
    }

    /// Change a job's status (validated against the DAG), bumping
    /// `updated_at` and staging the optional fields in the same write.
    pub fn update_job_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
        stage: Option<&str>,
        reason: Option<&str>,
        pr_url: Option<&str>,
    ) -> Result<Job> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let current = read_job(&tx, job_id)?.ok_or(StoreError::JobNotFound(job_id))?;
        if !current.status.can_transition_to(status) {
            return Err(StoreError::InvalidTransition {
                job_id,
                from: current.status,
                to: status,
            });
        }
        tx.execute(
            "UPDATE jobs SET status = ?2,
                             updated_at = ?3,
                             current_stage = COALESCE(?4, current_stage),
                             failure_reason = COALESCE(?5, failure_reason),
                             pr_url = COALESCE(?6, pr_url)
             WHERE job_id = ?1",
            params![
                job_id.to_string(),
                status.as_str(),
                ts(Utc::now()),
                stage,
                reason.filter(|r| !r.is_empty()),
                pr_url,
            ],
        )?;
        let job = read_job(&tx, job_id)?.ok_or(StoreError::JobNotFound(job_id))?;
        tx.commit()?;
        Ok(job)
    }

    /// Append a lifecycle event.
    pub fn add_job_event(
        &self,
        job_id: Uuid,
        stage: &str,
        kind: JobEventKind,
        message: &str,
        metadata: Option<BTreeMap<String, serde_json::Value>>,
    ) -> Result<JobEvent> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let event = insert_event(&tx, job_id, stage, kind, message, metadata)?;
        tx.commit()?;
        Ok(event)
    }

    /// All events for a job, oldest first.
    pub fn list_job_events(&self, job_id: Uuid) -> Result<Vec<JobEvent>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, job_id, stage, event_type, message, metadata, created_at
             FROM job_events WHERE job_id = ?1 ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![job_id.to_string()], event_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Record an operator approval (or explicit denial).
    pub fn add_approval(
        &self,
        job_id: Uuid,
        action: ApprovalAction,
        actor: &str,
        approved: bool,
        reason: Option<&str>,
    ) -> Result<Approval> {
        let conn = self.lock();
        let created_at = ts(Utc::now());
        conn.execute(
            "INSERT INTO approvals (job_id, action, approved, actor, reason, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                job_id.to_string(),
                action.as_str(),
                approved,
                actor,
                reason,
                created_at
            ],
        )?;
        let id = conn.last_insert_rowid();
        Ok(Approval {
            id,
            job_id,
            action,
            actor: actor.to_string(),
            approved,
            reason: reason.map(str::to_string),
            created_at: parse_ts(&created_at, "created_at")?,
        })
    }

    /// Whether an `approved=true` row exists for `(job_id, action)`.
    pub fn has_approval(&self, job_id: Uuid, action: ApprovalAction) -> Result<bool> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT 1 FROM approvals WHERE job_id = ?1 AND action = ?2 AND approved = 1 LIMIT 1",
        )?;
        let hit: Option<i64> = stmt
            .query_row(params![job_id.to_string(), action.as_str()], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(hit.is_some())
    }

    /// Append a policy audit row.
    pub fn add_policy_audit(
        &self,
        job_id: Uuid,
        decision: PolicyDecision,
        rule_id: &str,
        details: &str,
    ) -> Result<PolicyAudit> {
        let conn = self.lock();
        let created_at = ts(Utc::now());
        conn.execute(
            "INSERT INTO policy_audit (job_id, decision, rule_id, details, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                job_id.to_string(),
                decision.as_str(),
                rule_id,
                details,
                created_at
            ],
        )?;
        Ok(PolicyAudit {
            id: conn.last_insert_rowid(),
            job_id,
            decision,
            rule_id: rule_id.to_string(),
            details: details.to_string(),
            created_at: parse_ts(&created_at, "created_at")?,
        })
    }

    /// Audit rows for a job, oldest first.
    pub fn list_policy_audits(&self, job_id: Uuid) -> Result<Vec<PolicyAudit>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, job_id, decision, rule_id, details, created_at
             FROM policy_audit WHERE job_id = ?1 ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![job_id.to_string()], |row| {
            let raw_job_id: String = row.get(1)?;
            let raw_decision: String = row.get(2)?;
            let raw_created: String = row.get(5)?;
            let decode_err = |reason: String| {
                rusqlite::Error::FromSqlConversionFailure(
                    0,
                    rusqlite::types::Type::Text,
                    reason.into(),
                )
            };
            Ok(PolicyAudit {
                id: row.get(0)?,
                job_id: Uuid::parse_str(&raw_job_id).map_err(|e| decode_err(e.to_string()))?,
                decision: PolicyDecision::parse(&raw_decision)
                    .ok_or_else(|| decode_err(format!("unknown decision '{raw_decision}'")))?,
                rule_id: row.get(3)?,
                details: row.get(4)?,
                created_at: DateTime::parse_from_rfc3339(&raw_created)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|e| decode_err(e.to_string()))?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Charge a completion-model cost against a job: ledger row plus the
    /// job's accumulator, atomically.
    pub fn add_cost(
        &self,
        job_id: Uuid,
        model: &str,
        prompt_tokens: i64,
        completion_tokens: i64,
        cost_usd: f64,
    ) -> Result<CostEntry> {
        self.add_cost_at(job_id, model, prompt_tokens, completion_tokens, cost_usd, Utc::now())
    }

    /// [`add_cost`](Self::add_cost) with an explicit timestamp, so tests can
    /// place ledger rows in specific calendar windows.
    pub fn add_cost_at(
        &self,
        job_id: Uuid,
        model: &str,
        prompt_tokens: i64,
        completion_tokens: i64,
        cost_usd: f64,
        created_at: DateTime<Utc>,
    ) -> Result<CostEntry> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let created = ts(created_at);
        tx.execute(
            "INSERT INTO cost_ledger (job_id, model, prompt_tokens, completion_tokens,
                                      cost_usd, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                job_id.to_string(),
                model,
                prompt_tokens,
                completion_tokens,
                cost_usd,
                created
            ],
        )?;
        let id = tx.last_insert_rowid();
        let updated = tx.execute(
            "UPDATE jobs SET cost_usd = cost_usd + ?2, updated_at = ?3 WHERE job_id = ?1",
            params![job_id.to_string(), cost_usd, ts(Utc::now())],
        )?;
        if updated == 0 {
            return Err(StoreError::JobNotFound(job_id));
        }
        tx.commit()?;
        Ok(CostEntry {
            id,
            job_id,
            model: model.to_string(),
            prompt_tokens,
            completion_tokens,
            cost_usd,
            created_at,
        })
    }

    /// Ledger sum for one UTC calendar day.
    pub fn daily_cost(&self, day: NaiveDate) -> Result<f64> {
        let conn = self.lock();
        let total: f64 = conn.query_row(
            "SELECT COALESCE(SUM(cost_usd), 0.0) FROM cost_ledger
             WHERE substr(created_at, 1, 10) = ?1",
            params![day.format("%Y-%m-%d").to_string()],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    /// Ledger sum for one UTC calendar month.
    pub fn monthly_cost(&self, year: i32, month: u32) -> Result<f64> {
        let conn = self.lock();
        let total: f64 = conn.query_row(
            "SELECT COALESCE(SUM(cost_usd), 0.0) FROM cost_ledger
             WHERE substr(created_at, 1, 7) = ?1",
            params![format!("{year:04}-{month:02}")],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    /// Record an operational incident.
    pub fn add_incident(
        &self,
        incident_type: &str,
        severity: IncidentSeverity,
        status: IncidentStatus,
        details: &str,
    ) -> Result<Incident> {
        let conn = self.lock();
        let created_at = ts(Utc::now());
        let resolved_at = match status {
            IncidentStatus::Closed => Some(created_at.clone()),
            IncidentStatus::Open => None,
        };
        conn.execute(
            "INSERT INTO incidents (incident_type, severity, status, details, created_at,
                                    resolved_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                incident_type,
                severity.as_str(),
                status.as_str(),
                details,
                created_at,
                resolved_at
            ],
        )?;
        Ok(Incident {
            id: conn.last_insert_rowid(),
            incident_type: incident_type.to_string(),
            severity,
            status,
            details: details.to_string(),
            created_at: parse_ts(&created_at, "created_at")?,
            resolved_at: resolved_at
                .map(|r| parse_ts(&r, "resolved_at"))
                .transpose()?,
        })
    }

    /// Idempotently sync repo profiles from config.
    pub fn upsert_repo_profiles(&self, profiles: &BTreeMap<String, RepoProfileSeed>) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let now = ts(Utc::now());
        for (repo, seed) in profiles {
            tx.execute(
                "INSERT INTO repo_profiles (repo, enabled, default_base_branch, allowed_paths,
                                            acceptance_commands, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                 ON CONFLICT (repo) DO UPDATE SET
                     enabled = excluded.enabled,
                     default_base_branch = excluded.default_base_branch,
                     allowed_paths = excluded.allowed_paths,
                     acceptance_commands = excluded.acceptance_commands,
                     updated_at = excluded.updated_at",
                params![
                    repo,
                    seed.enabled,
                    seed.base_branch,
                    encode_strings(&seed.allowed_paths),
                    encode_strings(&seed.acceptance_commands),
                    now
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Fetch a repo profile by slug.
    pub fn get_repo_profile(&self, repo: &str) -> Result<Option<RepoProfile>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT repo, enabled, default_base_branch, allowed_paths, acceptance_commands,
                    created_at, updated_at
             FROM repo_profiles WHERE repo = ?1",
        )?;
        stmt.query_row(params![repo], |row| {
            Ok(RawRepoProfile {
                repo: row.get(0)?,
                enabled: row.get(1)?,
                default_base_branch: row.get(2)?,
                allowed_paths: row.get(3)?,
                acceptance_commands: row.get(4)?,
                created_at: row.get(5)?,
                updated_at: row.get(6)?,
            })
        })
        .optional()?
        .map(RawRepoProfile::decode)
        .transpose()
    }

    /// Number of jobs currently awaiting approval.
    pub fn pending_approval_count(&self) -> Result<i64> {
        self.count_status(JobStatus::AwaitingApproval)
    }

    /// Number of jobs currently queued (approximate queue depth when the
    /// queue backend cannot answer).
    pub fn queue_depth_estimate(&self) -> Result<i64> {
        self.count_status(JobStatus::Queued)
    }

    fn count_status(&self, status: JobStatus) -> Result<i64> {
        let conn = self.lock();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE status = ?1",
            params![status.as_str()],
            |row| row.get(0),
        )?;
        Ok(n)
    }

    /// Most recently failed jobs, newest first.
    pub fn list_failed_jobs(&self, limit: u32) -> Result<Vec<Job>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM jobs WHERE status = 'failed' ORDER BY updated_at DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], job_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }
}

// ---------------------------------------------------------------------------
// Row plumbing
// ---------------------------------------------------------------------------

fn resolve_location(database_url: &str) -> String {
    let trimmed = database_url.trim();
    for prefix in ["sqlite:///", "sqlite://", "sqlite:"] {
        if let Some(rest) = trimmed.strip_prefix(prefix) {
            if rest.is_empty() || rest == ":memory:" {
                return ":memory:".into();
            }
            return rest.to_string();
        }
    }
    trimmed.to_string()
}

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str, column: &'static str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt {
            column,
            reason: e.to_string(),
        })
}

fn encode_strings(values: &[String]) -> String {
    serde_json::to_string(values).unwrap_or_else(|_| "[]".into())
}

fn decode_strings(raw: &str, column: &'static str) -> Result<Vec<String>> {
    serde_json::from_str(raw).map_err(|e| StoreError::Corrupt {
        column,
        reason: e.to_string(),
    })
}

fn encode_actions(actions: &[ApprovalAction]) -> String {
    let strings: Vec<&str> = actions.iter().map(|a| a.as_str()).collect();
    serde_json::to_string(&strings).unwrap_or_else(|_| "[]".into())
}

fn decode_actions(raw: &str) -> Result<Vec<ApprovalAction>> {
    let strings: Vec<String> = decode_strings(raw, "requires_approval")?;
    strings
        .iter()
        .map(|s| {
            ApprovalAction::parse(s).ok_or(StoreError::Corrupt {
                column: "requires_approval",
                reason: format!("unknown action '{s}'"),
            })
        })
        .collect()
}

struct RawJob {
    job_id: String,
    repo: String,
    issue_number: i64,
    base_branch: String,
    risk_class: String,
    status: String,
    model_profile: String,
    requires_approval: String,
    allowed_paths: String,
    acceptance_commands: String,
    artifact_contract: String,
    caps_max_minutes: u32,
    caps_max_iterations: u32,
    caps_max_usd: f64,
    created_by: String,
    created_at: String,
    updated_at: String,
    current_stage: Option<String>,
    failure_reason: Option<String>,
    pr_url: Option<String>,
    cost_usd: f64,
}

impl RawJob {
    fn decode(self) -> Result<Job> {
        Ok(Job {
            id: Uuid::parse_str(&self.job_id).map_err(|e| StoreError::Corrupt {
                column: "job_id",
                reason: e.to_string(),
            })?,
            repo: self.repo,
            issue_number: self.issue_number,
            base_branch: self.base_branch,
            risk_class: RiskClass::parse(&self.risk_class).ok_or(StoreError::Corrupt {
                column: "risk_class",
                reason: self.risk_class.clone(),
            })?,
            status: JobStatus::parse(&self.status).ok_or(StoreError::Corrupt {
                column: "status",
                reason: self.status.clone(),
            })?,
            model_profile: ModelProfile::parse(&self.model_profile).ok_or(StoreError::Corrupt {
                column: "model_profile",
                reason: self.model_profile.clone(),
            })?,
            requires_approval: decode_actions(&self.requires_approval)?,
            allowed_paths: decode_strings(&self.allowed_paths, "allowed_paths")?,
            acceptance_commands: decode_strings(&self.acceptance_commands, "acceptance_commands")?,
            artifact_contract: decode_strings(&self.artifact_contract, "artifact_contract")?,
            caps: Caps {
                max_minutes: self.caps_max_minutes,
                max_iterations: self.caps_max_iterations,
                max_usd: self.caps_max_usd,
            },
            created_by: self.created_by,
            created_at: parse_ts(&self.created_at, "created_at")?,
            updated_at: parse_ts(&self.updated_at, "updated_at")?,
            current_stage: self.current_stage,
            failure_reason: self.failure_reason,
            pr_url: self.pr_url,
            cost_usd: self.cost_usd,
        })
    }
}

fn job_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Job> {
    let raw = RawJob {
        job_id: row.get("job_id")?,
        repo: row.get("repo")?,
        issue_number: row.get("issue_number")?,
        base_branch: row.get("base_branch")?,
        risk_class: row.get("risk_class")?,
        status: row.get("status")?,
        model_profile: row.get("model_profile")?,
        requires_approval: row.get("requires_approval")?,
        allowed_paths: row.get("allowed_paths")?,
        acceptance_commands: row.get("acceptance_commands")?,
        artifact_contract: row.get("artifact_contract")?,
        caps_max_minutes: row.get("caps_max_minutes")?,
        caps_max_iterations: row.get("caps_max_iterations")?,
        caps_max_usd: row.get("caps_max_usd")?,
        created_by: row.get("created_by")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
        current_stage: row.get("current_stage")?,
        failure_reason: row.get("failure_reason")?,
        pr_url: row.get("pr_url")?,
        cost_usd: row.get("cost_usd")?,
    };
    raw.decode()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}

fn read_job(conn: &Connection, job_id: Uuid) -> Result<Option<Job>> {
    let mut stmt = conn.prepare("SELECT * FROM jobs WHERE job_id = ?1")?;
    stmt.query_row(params![job_id.to_string()], job_from_row)
        .optional()
        .map_err(Into::into)
}

fn insert_event(
    conn: &Connection,
    job_id: Uuid,
    stage: &str,
    kind: JobEventKind,
    message: &str,
    metadata: Option<BTreeMap<String, serde_json::Value>>,
) -> Result<JobEvent> {
    let created_at = ts(Utc::now());
    let metadata_json = metadata
        .as_ref()
        .map(|m| serde_json::to_string(m).unwrap_or_else(|_| "{}".into()));
    conn.execute(
        "INSERT INTO job_events (job_id, stage, event_type, message, metadata, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            job_id.to_string(),
            stage,
            kind.as_str(),
            message,
            metadata_json,
            created_at
        ],
    )?;
    Ok(JobEvent {
        id: conn.last_insert_rowid(),
        job_id,
        stage: stage.to_string(),
        kind,
        message: message.to_string(),
        metadata,
        created_at: parse_ts(&created_at, "created_at")?,
    })
}

fn event_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobEvent> {
    let job_id: String = row.get(1)?;
    let kind: String = row.get(3)?;
    let metadata: Option<String> = row.get(5)?;
    let created_at: String = row.get(6)?;
    let decode_err = |reason: String| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            reason.into(),
        )
    };
    Ok(JobEvent {
        id: row.get(0)?,
        job_id: Uuid::parse_str(&job_id).map_err(|e| decode_err(e.to_string()))?,
        stage: row.get(2)?,
        kind: JobEventKind::parse(&kind)
            .ok_or_else(|| decode_err(format!("unknown event type '{kind}'")))?,
        message: row.get(4)?,
        metadata: metadata
            .map(|m| serde_json::from_str(&m).map_err(|e| decode_err(e.to_string())))
            .transpose()?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| decode_err(e.to_string()))?,
    })
}

struct RawRepoProfile {
    repo: String,
    enabled: bool,
    default_base_branch: String,
    allowed_paths: String,
    acceptance_commands: String,
    created_at: String,
    updated_at: String,
}

impl RawRepoProfile {
    fn decode(self) -> Result<RepoProfile> {
        Ok(RepoProfile {
            repo: self.repo,
            enabled: self.enabled,
            default_base_branch: self.default_base_branch,
            allowed_paths: decode_strings(&self.allowed_paths, "allowed_paths")?,
            acceptance_commands: decode_strings(&self.acceptance_commands, "acceptance_commands")?,
            created_at: parse_ts(&self.created_at, "created_at")?,
            updated_at: parse_ts(&self.updated_at, "updated_at")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn memory_store() -> JobStore {
        let store = JobStore::open(":memory:").unwrap();
        store.init_schema().unwrap();
        store
    }

    fn queued_job(store: &JobStore) -> Job {
        store.create_job(&JobSpec::new("acme/repo", 42)).unwrap()
    }

    #[test]
    fn create_job_writes_created_event_atomically() {
        let store = memory_store();
        let job = queued_job(&store);
        assert_eq!(job.status, JobStatus::Queued);
        assert!((job.cost_usd - 0.0).abs() < f64::EPSILON);

        let events = store.list_job_events(job.id).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, JobEventKind::Created);
        assert_eq!(events[0].stage, "enqueue");
        let meta = events[0].metadata.as_ref().unwrap();
        assert_eq!(meta["source"], "system");
    }

    #[test]
    fn job_roundtrips_every_field() {
        let store = memory_store();
        let mut spec = JobSpec::new("acme/repo", 7);
        spec.risk_class = RiskClass::Destructive;
        spec.model_profile = ModelProfile::Review;
        spec.allowed_paths = vec!["src/**".into()];
        spec.acceptance_commands = vec!["pytest -q".into()];
        spec.requires_approval = vec![ApprovalAction::Destructive, ApprovalAction::Merge];
        spec.caps = Caps {
            max_minutes: 10,
            max_iterations: 3,
            max_usd: 1.5,
        };
        store.create_job(&spec).unwrap();

        let job = store.get_job(spec.job_id).unwrap().unwrap();
        assert_eq!(job.risk_class, RiskClass::Destructive);
        assert_eq!(job.model_profile, ModelProfile::Review);
        assert_eq!(job.allowed_paths, vec!["src/**"]);
        assert_eq!(job.acceptance_commands, vec!["pytest -q"]);
        assert_eq!(
            job.requires_approval,
            vec![ApprovalAction::Destructive, ApprovalAction::Merge]
        );
        assert_eq!(job.caps.max_minutes, 10);
    }

    #[test]
    fn status_dag_is_enforced() {
        let store = memory_store();
        let job = queued_job(&store);

        store
            .update_job_status(job.id, JobStatus::Running, Some("triage"), None, None)
            .unwrap();
        let err = store
            .update_job_status(job.id, JobStatus::Queued, None, None, None)
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));

        store
            .update_job_status(job.id, JobStatus::Completed, Some("pr"), None, Some("url"))
            .unwrap();
        let err = store
            .update_job_status(job.id, JobStatus::Running, None, None, None)
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[test]
    fn terminal_write_carries_reason_and_pr_url() {
        let store = memory_store();
        let job = queued_job(&store);
        store
            .update_job_status(job.id, JobStatus::Running, Some("execute"), None, None)
            .unwrap();
        let failed = store
            .update_job_status(
                job.id,
                JobStatus::Failed,
                Some("execute"),
                Some("ALLOWED_PATHS_VIOLATION"),
                None,
            )
            .unwrap();
        assert_eq!(failed.failure_reason.as_deref(), Some("ALLOWED_PATHS_VIOLATION"));
        assert_eq!(failed.current_stage.as_deref(), Some("execute"));
        assert!(failed.updated_at >= failed.created_at);
    }

    #[test]
    fn empty_reason_does_not_clobber() {
        let store = memory_store();
        let job = queued_job(&store);
        store
            .update_job_status(job.id, JobStatus::Running, Some("triage"), None, None)
            .unwrap();
        store
            .update_job_status(job.id, JobStatus::Failed, None, Some("CODE_A"), None)
            .unwrap();
        let job = store
            .update_job_status(job.id, JobStatus::Failed, None, Some(""), None)
            .unwrap();
        assert_eq!(job.failure_reason.as_deref(), Some("CODE_A"));
    }

    #[test]
    fn cost_accumulator_matches_ledger_sum() {
        let store = memory_store();
        let job = queued_job(&store);
        store.add_cost(job.id, "m1", 100, 20, 0.012).unwrap();
        store.add_cost(job.id, "m2", 50, 10, 0.003).unwrap();
        store.add_cost(job.id, "m3", 10, 5, 0.0001).unwrap();

        let job = store.get_job(job.id).unwrap().unwrap();
        assert!((job.cost_usd - 0.0151).abs() < 1e-6);

        let today = Utc::now().date_naive();
        assert!((store.daily_cost(today).unwrap() - 0.0151).abs() < 1e-6);
    }

    #[test]
    fn cost_for_unknown_job_is_rejected() {
        let store = memory_store();
        let err = store.add_cost(Uuid::new_v4(), "m", 1, 1, 0.1).unwrap_err();
        assert!(matches!(err, StoreError::JobNotFound(_)));
    }

    #[test]
    fn daily_and_monthly_windows_are_calendar_utc() {
        let store = memory_store();
        let job = queued_job(&store);
        let in_window = Utc.with_ymd_and_hms(2026, 3, 15, 12, 0, 0).unwrap();
        let prior_day = Utc.with_ymd_and_hms(2026, 3, 14, 23, 59, 59).unwrap();
        let prior_month = Utc.with_ymd_and_hms(2026, 2, 28, 12, 0, 0).unwrap();
        store.add_cost_at(job.id, "m", 1, 1, 1.0, in_window).unwrap();
        store.add_cost_at(job.id, "m", 1, 1, 2.0, prior_day).unwrap();
        store.add_cost_at(job.id, "m", 1, 1, 4.0, prior_month).unwrap();

        let day = NaiveDate::from_ymd_opt(2026, 3, 15).unwrap();
        assert!((store.daily_cost(day).unwrap() - 1.0).abs() < 1e-9);
        assert!((store.monthly_cost(2026, 3).unwrap() - 3.0).abs() < 1e-9);
        assert!((store.monthly_cost(2026, 2).unwrap() - 4.0).abs() < 1e-9);
        let empty = NaiveDate::from_ymd_opt(2026, 4, 1).unwrap();
        assert!((store.daily_cost(empty).unwrap() - 0.0).abs() < 1e-9);
    }

    #[test]
    fn has_approval_requires_approved_true() {
        let store = memory_store();
        let job = queued_job(&store);
        assert!(!store.has_approval(job.id, ApprovalAction::Infra).unwrap());

        store
            .add_approval(job.id, ApprovalAction::Infra, "op", false, Some("nope"))
            .unwrap();
        assert!(!store.has_approval(job.id, ApprovalAction::Infra).unwrap());

        store
            .add_approval(job.id, ApprovalAction::Infra, "op", true, None)
            .unwrap();
        assert!(store.has_approval(job.id, ApprovalAction::Infra).unwrap());
        assert!(!store.has_approval(job.id, ApprovalAction::Secrets).unwrap());
    }

    #[test]
    fn latest_job_for_issue_picks_newest() {
        let store = memory_store();
        let mut first = JobSpec::new("acme/repo", 9);
        first.created_at = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        store.create_job(&first).unwrap();
        let mut second = JobSpec::new("acme/repo", 9);
        second.created_at = Utc.with_ymd_and_hms(2026, 1, 2, 0, 0, 0).unwrap();
        store.create_job(&second).unwrap();

        let latest = store.latest_job_for_issue("acme/repo", 9).unwrap().unwrap();
        assert_eq!(latest.id, second.job_id);
        assert!(store.latest_job_for_issue("acme/repo", 10).unwrap().is_none());
    }

    #[test]
    fn upsert_repo_profiles_is_idempotent() {
        let store = memory_store();
        let mut profiles = BTreeMap::new();
        profiles.insert(
            "acme/repo".to_string(),
            RepoProfileSeed {
                enabled: true,
                base_branch: "main".into(),
                allowed_paths: vec!["src/**".into()],
                acceptance_commands: vec!["pytest -q".into()],
            },
        );
        store.upsert_repo_profiles(&profiles).unwrap();
        store.upsert_repo_profiles(&profiles).unwrap();

        let profile = store.get_repo_profile("acme/repo").unwrap().unwrap();
        assert!(profile.enabled);
        assert_eq!(profile.allowed_paths, vec!["src/**"]);

        profiles.get_mut("acme/repo").unwrap().enabled = false;
        store.upsert_repo_profiles(&profiles).unwrap();
        let profile = store.get_repo_profile("acme/repo").unwrap().unwrap();
        assert!(!profile.enabled);
    }

    #[test]
    fn counters_and_failed_listing() {
        let store = memory_store();
        let a = queued_job(&store);
        let b = store.create_job(&JobSpec::new("acme/repo", 43)).unwrap();
        let c = store.create_job(&JobSpec::new("acme/repo", 44)).unwrap();
        assert_eq!(store.queue_depth_estimate().unwrap(), 3);

        store
            .update_job_status(a.id, JobStatus::AwaitingApproval, Some("approval"), None, None)
            .unwrap();
        assert_eq!(store.pending_approval_count().unwrap(), 1);

        store
            .update_job_status(b.id, JobStatus::Running, None, None, None)
            .unwrap();
        store
            .update_job_status(b.id, JobStatus::Failed, None, Some("NO_PATCH_GENERATED"), None)
            .unwrap();
        store
            .update_job_status(c.id, JobStatus::Running, None, None, None)
            .unwrap();
        store
            .update_job_status(c.id, JobStatus::Failed, None, Some("KILL_SWITCH_ACTIVE"), None)
            .unwrap();

        let failed = store.list_failed_jobs(10).unwrap();
        assert_eq!(failed.len(), 2);
        assert_eq!(store.list_failed_jobs(1).unwrap().len(), 1);
    }

    #[test]
    fn events_are_strictly_ordered() {
        let store = memory_store();
        let job = queued_job(&store);
        for i in 0..5 {
            store
                .add_job_event(job.id, "triage", JobEventKind::Completed, &format!("e{i}"), None)
                .unwrap();
        }
        let events = store.list_job_events(job.id).unwrap();
        let ids: Vec<i64> = events.iter().map(|e| e.id).collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert_eq!(ids, sorted);
        for pair in events.windows(2) {
            assert!(pair[0].created_at <= pair[1].created_at);
        }
    }

    #[test]
    fn database_url_forms_resolve() {
        assert_eq!(resolve_location(":memory:"), ":memory:");
        assert_eq!(resolve_location("sqlite://"), ":memory:");
        assert_eq!(resolve_location("sqlite:///tmp/x.db"), "tmp/x.db");
        assert_eq!(resolve_location("sqlite://tmp/x.db"), "tmp/x.db");
        assert_eq!(resolve_location("data/gaffer.db"), "data/gaffer.db");
    }

    #[test]
    fn open_on_disk_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.db");
        let url = path.to_string_lossy().to_string();
        let store = JobStore::open(&url).unwrap();
        store.init_schema().unwrap();
        let job = store.create_job(&JobSpec::new("acme/repo", 1)).unwrap();
        drop(store);

        let store = JobStore::open(&url).unwrap();
        store.init_schema().unwrap();
        let loaded = store.get_job(job.id).unwrap().unwrap();
        assert_eq!(loaded.repo, "acme/repo");
    }
}
