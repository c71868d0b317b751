// SPDX-License-Identifier: MIT OR Apache-2.0
//! gaffer-config
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Runtime settings, constructed once at bootstrap from the environment and
//! threaded through components explicitly. No process singletons.

use serde::{Deserialize, Serialize};

/// Errors from settings construction.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable held a value the field cannot accept.
    #[error("invalid value for {var}: {reason}")]
    InvalidValue {
        /// Variable name.
        var: String,
        /// What was wrong with it.
        reason: String,
    },
}

/// Deployment mode: `fast` short-circuits the forge and command execution
/// for offline testing, `release` talks to real services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Simulated forge/LLM/commands.
    Fast,
    /// Real forge/LLM/commands.
    Release,
}

/// Queue retry and TTL knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Queue list name.
    pub name: String,
    /// Maximum redeliveries after a worker-level crash (0–10).
    pub retry_max: u32,
    /// Retry backoff schedule in seconds (pre-normalization).
    pub retry_intervals: Vec<u64>,
    /// Per-job queue timeout in seconds.
    pub job_timeout_seconds: u64,
    /// How long successful results are retained.
    pub result_ttl_seconds: u64,
    /// How long failures are retained.
    pub failure_ttl_seconds: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            name: "jobs".into(),
            retry_max: 2,
            retry_intervals: vec![30, 120],
            job_timeout_seconds: 3600,
            result_ttl_seconds: 86_400,
            failure_ttl_seconds: 1_209_600,
        }
    }
}

/// The complete runtime configuration record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Deployment environment label.
    pub app_env: String,
    /// Log verbosity fed to the env filter.
    pub log_level: String,

    /// SQLite location: a path, `sqlite://` URL, or `:memory:`.
    pub database_url: String,
    /// Redis connection URL for the queue backend.
    pub redis_url: String,
    /// Use the in-process queue backend instead of Redis.
    pub disable_queue: bool,
    /// Queue retry/TTL knobs.
    pub queue: QueueSettings,

    /// Webhook HMAC secret; empty disables verification.
    pub webhook_secret: String,
    /// Operator token; empty disables the check.
    pub operator_token: String,

    /// Policy YAML path.
    pub policy_path: String,
    /// Repo-profiles YAML path.
    pub repos_path: String,
    /// Root directory for per-job artifact trees.
    pub artifact_root: String,

    /// Create the schema at bootstrap.
    pub auto_migrate: bool,
    /// Simulated vs real execution.
    pub run_mode: RunMode,

    /// Cluster-wide daily spend cap in USD.
    pub max_usd_per_day: f64,
    /// Cluster-wide monthly spend cap in USD.
    pub max_usd_per_month: f64,

    /// Model for the triage stage.
    pub model_triage: String,
    /// Model for the plan/execute stages.
    pub model_build: String,
    /// Model for the review stage.
    pub model_review: String,

    /// Completion service base URL.
    pub llm_base_url: String,
    /// Completion service API key; empty omits the Authorization header.
    pub llm_api_key: String,

    /// GitHub App id.
    pub github_app_id: String,
    /// GitHub App installation id.
    pub github_app_installation_id: String,
    /// GitHub App private key PEM (literal `\n` sequences accepted).
    pub github_app_private_key_pem: String,

    /// Control-plane bind host.
    pub api_host: String,
    /// Control-plane bind port.
    pub api_port: u16,
    /// Worker metrics bind host.
    pub worker_metrics_host: String,
    /// Worker metrics bind port.
    pub worker_metrics_port: u16,
    /// Whether the worker exposes metrics at all.
    pub worker_metrics_enabled: bool,

    /// Container image used by the command sandbox.
    pub sandbox_image: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            app_env: "dev".into(),
            log_level: "info".into(),
            database_url: "data/gaffer.db".into(),
            redis_url: "redis://localhost:6379/0".into(),
            disable_queue: false,
            queue: QueueSettings::default(),
            webhook_secret: String::new(),
            operator_token: "replace_me".into(),
            policy_path: "config/policy.yaml".into(),
            repos_path: "config/repos.yaml".into(),
            artifact_root: "data/artifacts".into(),
            auto_migrate: true,
            run_mode: RunMode::Fast,
            max_usd_per_day: 40.0,
            max_usd_per_month: 900.0,
            model_triage: "gpt-4o-mini".into(),
            model_build: "gpt-4.1".into(),
            model_review: "gpt-4.1-mini".into(),
            llm_base_url: "http://localhost:4000".into(),
            llm_api_key: String::new(),
            github_app_id: String::new(),
            github_app_installation_id: String::new(),
            github_app_private_key_pem: String::new(),
            api_host: "0.0.0.0".into(),
            api_port: 8080,
            worker_metrics_host: "0.0.0.0".into(),
            worker_metrics_port: 9108,
            worker_metrics_enabled: true,
            sandbox_image: "python:3.12-slim".into(),
        }
    }
}

impl Settings {
    /// Build settings from the process environment, falling back to the
    /// documented defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut s = Settings::default();

        if let Some(v) = read("APP_ENV") {
            s.app_env = v;
        }
        if let Some(v) = read("LOG_LEVEL") {
            s.log_level = v;
        }
        if let Some(v) = read("DATABASE_URL") {
            s.database_url = v;
        }
        if let Some(v) = read("REDIS_URL") {
            s.redis_url = v;
        }
        if let Some(v) = read("QUEUE_NAME") {
            s.queue.name = v;
        }
        if let Some(v) = read("DISABLE_QUEUE") {
            s.disable_queue = parse_bool("DISABLE_QUEUE", &v)?;
        }
        if let Some(v) = read("WEBHOOK_SECRET") {
            s.webhook_secret = v;
        }
        if let Some(v) = read("OPERATOR_TOKEN") {
            s.operator_token = v;
        }
        if let Some(v) = read("POLICY_PATH") {
            s.policy_path = v;
        }
        if let Some(v) = read("REPOS_PATH") {
            s.repos_path = v;
        }
        if let Some(v) = read("ARTIFACT_ROOT") {
            s.artifact_root = v;
        }
        if let Some(v) = read("AUTO_MIGRATE") {
            s.auto_migrate = parse_bool("AUTO_MIGRATE", &v)?;
        }
        if let Some(v) = read("RUN_MODE") {
            s.run_mode = parse_run_mode(&v)?;
        }
        if let Some(v) = read("QUEUE_RETRY_MAX") {
            let parsed = parse_u64("QUEUE_RETRY_MAX", &v)?;
            if parsed > 10 {
                return Err(ConfigError::InvalidValue {
                    var: "QUEUE_RETRY_MAX".into(),
                    reason: format!("{parsed} exceeds the maximum of 10"),
                });
            }
            s.queue.retry_max = parsed as u32;
        }
        if let Some(v) = read("QUEUE_RETRY_INTERVALS") {
            s.queue.retry_intervals = parse_interval_list(&v);
        }
        if let Some(v) = read("QUEUE_JOB_TIMEOUT_SECONDS") {
            s.queue.job_timeout_seconds = parse_u64("QUEUE_JOB_TIMEOUT_SECONDS", &v)?;
        }
        if let Some(v) = read("QUEUE_RESULT_TTL_SECONDS") {
            s.queue.result_ttl_seconds = parse_u64("QUEUE_RESULT_TTL_SECONDS", &v)?;
        }
        if let Some(v) = read("QUEUE_FAILURE_TTL_SECONDS") {
            s.queue.failure_ttl_seconds = parse_u64("QUEUE_FAILURE_TTL_SECONDS", &v)?;
        }
        if let Some(v) = read("MAX_USD_PER_DAY") {
            s.max_usd_per_day = parse_f64("MAX_USD_PER_DAY", &v)?;
        }
        if let Some(v) = read("MAX_USD_PER_MONTH") {
            s.max_usd_per_month = parse_f64("MAX_USD_PER_MONTH", &v)?;
        }
        if let Some(v) = read("MODEL_TRIAGE") {
            s.model_triage = v;
        }
        if let Some(v) = read("MODEL_BUILD") {
            s.model_build = v;
        }
        if let Some(v) = read("MODEL_REVIEW") {
            s.model_review = v;
        }
        if let Some(v) = read("LLM_BASE_URL") {
            s.llm_base_url = v;
        }
        if let Some(v) = read("LLM_API_KEY") {
            s.llm_api_key = v;
        }
        if let Some(v) = read("GITHUB_APP_ID") {
            s.github_app_id = v;
        }
        if let Some(v) = read("GITHUB_APP_INSTALLATION_ID") {
            s.github_app_installation_id = v;
        }
        if let Some(v) = read("GITHUB_APP_PRIVATE_KEY_PEM") {
            s.github_app_private_key_pem = v;
        }
        if let Some(v) = read("API_HOST") {
            s.api_host = v;
        }
        if let Some(v) = read("API_PORT") {
            s.api_port = parse_u64("API_PORT", &v)? as u16;
        }
        if let Some(v) = read("WORKER_METRICS_HOST") {
            s.worker_metrics_host = v;
        }
        if let Some(v) = read("WORKER_METRICS_PORT") {
            s.worker_metrics_port = parse_u64("WORKER_METRICS_PORT", &v)? as u16;
        }
        if let Some(v) = read("WORKER_METRICS_ENABLED") {
            s.worker_metrics_enabled = parse_bool("WORKER_METRICS_ENABLED", &v)?;
        }
        if let Some(v) = read("SANDBOX_IMAGE") {
            s.sandbox_image = v;
        }

        Ok(s)
    }

    /// Whether forge and command execution are simulated.
    pub fn is_fast_mode(&self) -> bool {
        self.run_mode == RunMode::Fast
    }

    /// Whether the real forge/LLM clients are in play.
    pub fn is_release_mode(&self) -> bool {
        self.run_mode == RunMode::Release
    }
}

fn read(var: &str) -> Option<String> {
    std::env::var(var).ok()
}

fn parse_bool(var: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::InvalidValue {
            var: var.into(),
            reason: format!("expected a boolean, got '{other}'"),
        }),
    }
}

fn parse_u64(var: &str, value: &str) -> Result<u64, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        var: var.into(),
        reason: format!("expected an integer, got '{value}'"),
    })
}

fn parse_f64(var: &str, value: &str) -> Result<f64, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        var: var.into(),
        reason: format!("expected a number, got '{value}'"),
    })
}

fn parse_run_mode(value: &str) -> Result<RunMode, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "fast" => Ok(RunMode::Fast),
        "release" => Ok(RunMode::Release),
        other => Err(ConfigError::InvalidValue {
            var: "RUN_MODE".into(),
            reason: format!("expected 'fast' or 'release', got '{other}'"),
        }),
    }
}

/// Parse a comma-separated interval list; non-positive or unparsable entries
/// are dropped, and an empty result falls back to the default schedule.
fn parse_interval_list(value: &str) -> Vec<u64> {
    let parsed: Vec<u64> = value
        .split(',')
        .filter_map(|part| part.trim().parse::<i64>().ok())
        .filter(|n| *n > 0)
        .map(|n| n as u64)
        .collect();
    if parsed.is_empty() {
        QueueSettings::default().retry_intervals
    } else {
        parsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documentation() {
        let s = Settings::default();
        assert_eq!(s.queue.name, "jobs");
        assert_eq!(s.queue.retry_max, 2);
        assert_eq!(s.queue.retry_intervals, vec![30, 120]);
        assert!((s.max_usd_per_day - 40.0).abs() < f64::EPSILON);
        assert!((s.max_usd_per_month - 900.0).abs() < f64::EPSILON);
        assert!(s.is_fast_mode());
        assert!(!s.is_release_mode());
    }

    #[test]
    fn run_mode_parsing_is_case_insensitive() {
        assert_eq!(parse_run_mode(" FAST ").unwrap(), RunMode::Fast);
        assert_eq!(parse_run_mode("Release").unwrap(), RunMode::Release);
        assert!(parse_run_mode("dryrun").is_err());
    }

    #[test]
    fn interval_list_parsing() {
        assert_eq!(parse_interval_list("10, 20,30"), vec![10, 20, 30]);
        assert_eq!(parse_interval_list("0,-5,abc"), vec![30, 120]);
        assert_eq!(parse_interval_list(""), vec![30, 120]);
    }

    #[test]
    fn bool_parsing() {
        assert!(parse_bool("X", "true").unwrap());
        assert!(parse_bool("X", "1").unwrap());
        assert!(!parse_bool("X", "Off").unwrap());
        assert!(parse_bool("X", "maybe").is_err());
    }
}
