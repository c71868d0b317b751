// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]

use anyhow::{Context, Result, bail};
use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use gaffer_config::Settings;
use gaffer_daemon::profile_seeds;
use gaffer_integrations::{completion_client, forge_client};
use gaffer_policy::{PolicyProfile, load_repo_profiles};
use gaffer_queue::{QueueBackend, RedisQueue};
use gaffer_runner::JobProcessor;
use gaffer_store::JobStore;
use gaffer_telemetry::{METRICS_CONTENT_TYPE, Metrics};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "gaffer-worker", version, about = "Gaffer job worker")]
struct Args {
    /// How long each queue poll blocks, in seconds.
    #[arg(long, default_value_t = 5)]
    poll_seconds: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let settings = Settings::from_env().context("load settings")?;
    gaffer_telemetry::init_tracing(&settings.log_level, settings.app_env != "dev");

    if settings.disable_queue {
        bail!("DISABLE_QUEUE is set; the worker requires the Redis queue backend");
    }

    let store = Arc::new(JobStore::open(&settings.database_url).context("open job store")?);
    if settings.auto_migrate {
        store.init_schema().context("initialize schema")?;
    }

    let policy = Arc::new(
        PolicyProfile::load(&settings.policy_path)
            .with_context(|| format!("load policy from {}", settings.policy_path))?,
    );
    let profiles = load_repo_profiles(&settings.repos_path)
        .with_context(|| format!("load repo profiles from {}", settings.repos_path))?;
    store
        .upsert_repo_profiles(&profile_seeds(&profiles))
        .context("seed repo profiles")?;

    let queue: Arc<dyn QueueBackend> = Arc::new(
        RedisQueue::connect(&settings.redis_url, &settings.queue.name)
            .await
            .context("connect queue backend")?,
    );

    let metrics = Arc::new(Metrics::new());
    let settings = Arc::new(settings);
    let processor = JobProcessor::new(
        store,
        policy,
        settings.clone(),
        metrics.clone(),
        queue.clone(),
        completion_client(&settings),
        forge_client(&settings),
    );

    if settings.worker_metrics_enabled {
        spawn_metrics_server(&settings, metrics.clone()).await?;
    }

    // Envelopes parked by a crashed worker go back on the queue, bounded by
    // the retry budget and paced by its backoff schedule.
    let retry_policy = gaffer_queue::build_retry_policy(&settings.queue);
    let reclaimed = queue.reclaim(retry_policy.as_ref()).await?;
    if reclaimed > 0 {
        info!(count = reclaimed, "requeued envelopes from a previous worker");
    }

    info!(queue = %settings.queue.name, "gaffer-worker started");
    let poll = Duration::from_secs(args.poll_seconds.max(1));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                return Ok(());
            }
            claimed = queue.claim(poll) => {
                metrics
                    .worker_heartbeat
                    .set(chrono::Utc::now().timestamp() as f64);
                let envelope = match claimed {
                    Ok(Some(envelope)) => envelope,
                    Ok(None) => continue,
                    Err(err) => {
                        error!(error = %err, "queue claim failed");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                };

                info!(job_id = %envelope.job_id, attempt = envelope.attempt, "dispatching job");
                if let Err(err) = processor.process(envelope.job_id).await {
                    error!(job_id = %envelope.job_id, error = %err, "dispatch errored");
                }
                // In-handler failures are terminal for the job; only a
                // worker-level crash leaves the envelope unacked.
                if let Err(err) = queue.ack(&envelope).await {
                    error!(job_id = %envelope.job_id, error = %err, "queue ack failed");
                }
            }
        }
    }
}

async fn spawn_metrics_server(settings: &Settings, metrics: Arc<Metrics>) -> Result<()> {
    let bind = format!(
        "{}:{}",
        settings.worker_metrics_host, settings.worker_metrics_port
    );
    let app = Router::new()
        .route(
            "/healthz",
            get(|| async { Json(serde_json::json!({ "status": "ok" })) }),
        )
        .route(
            "/metrics",
            get(move || {
                let metrics = metrics.clone();
                async move {
                    (
                        [("content-type", METRICS_CONTENT_TYPE)],
                        metrics.render(),
                    )
                }
            }),
        );
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind worker metrics on {bind}"))?;
    info!(bind = %bind, "worker metrics listening");
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            error!(error = %err, "worker metrics server exited");
        }
    });
    Ok(())
}
