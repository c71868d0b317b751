// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]

use anyhow::{Context, Result};
use clap::Parser;
use gaffer_config::Settings;
use gaffer_daemon::{AppState, build_app, profile_seeds};
use gaffer_integrations::forge_client;
use gaffer_policy::{PolicyProfile, load_repo_profiles};
use gaffer_queue::{InProcessQueue, QueueBackend, RedisQueue, agents_enabled};
use gaffer_store::JobStore;
use gaffer_telemetry::Metrics;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "gaffer-daemon", version, about = "Gaffer control-plane daemon")]
struct Args {
    /// Bind address override (defaults to API_HOST:API_PORT).
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let settings = Settings::from_env().context("load settings")?;
    gaffer_telemetry::init_tracing(&settings.log_level, settings.app_env != "dev");

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

    let queue: Arc<dyn QueueBackend> = if settings.disable_queue {
        Arc::new(InProcessQueue::new())
    } else {
        Arc::new(
            RedisQueue::connect(&settings.redis_url, &settings.queue.name)
                .await
                .context("connect queue backend")?,
        )
    };

    let metrics = Arc::new(Metrics::new());
    let enabled = agents_enabled(queue.as_ref()).await.unwrap_or(true);
    metrics.agents_enabled.set(if enabled { 1.0 } else { 0.0 });

    let settings = Arc::new(settings);
    let state = Arc::new(AppState {
        forge: forge_client(&settings),
        settings: settings.clone(),
        store,
        policy,
        queue,
        metrics,
    });

    let bind = args
        .bind
        .unwrap_or_else(|| format!("{}:{}", settings.api_host, settings.api_port));
    let app = build_app(state);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    info!(bind = %bind, env = %settings.app_env, "gaffer-daemon listening");

    axum::serve(listener, app).await.context("serve")
}
