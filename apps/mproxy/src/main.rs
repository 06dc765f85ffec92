use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser as _;
use tracing_subscriber::EnvFilter;

use mproxy_core::{ProxyConfig, ProxyEngine, QueueLogSink, RequestLogSink};
use mproxy_core::resolver::ModelView;
use mproxy_pool::{KeyPool, StrategyRegistry};
use mproxy_storage::{SqlStorage, spawn_log_writer};

mod cli;

const LOG_QUEUE_CAPACITY: usize = 65_536;
const STATS_FLUSH_INTERVAL: Duration = Duration::from_secs(30);
const ROTATION_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = cli::Cli::parse();
    let config = load_config(args.config.as_deref())?;

    let master_key = args.master_key.unwrap_or_else(|| {
        tracing::warn!("MPROXY_MASTER_KEY not set, using an insecure development secret");
        "default-master-key-change-in-production".to_string()
    });

    let storage = Arc::new(
        SqlStorage::connect(&args.dsn, &master_key)
            .await
            .context("connect to database")?,
    );
    storage.sync().await.context("sync schema")?;
    storage
        .seed_default_models()
        .await
        .context("seed default models")?;

    let view = Arc::new(ModelView::new(
        storage.load_model_configs().await.context("load models")?,
    ));
    let pool = Arc::new(KeyPool::new(
        StrategyRegistry::new(),
        config.pricing.clone(),
    ));
    for key in storage.load_api_keys().await.context("load api keys")? {
        pool.insert(key).await;
    }

    let (log_sink, log_rx) = QueueLogSink::new(LOG_QUEUE_CAPACITY);
    let log_sink: Arc<dyn RequestLogSink> = Arc::new(log_sink);
    spawn_log_writer(storage.clone(), log_rx);

    let engine = Arc::new(
        ProxyEngine::new(view, pool.clone(), &config, log_sink).context("build engine")?,
    );

    spawn_stats_flusher(storage.clone(), pool.clone());
    spawn_rotation_sweeper(pool);

    let app = mproxy_router::api_router(engine);
    let bind = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    tracing::info!(%bind, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}

fn load_config(path: Option<&str>) -> Result<ProxyConfig> {
    let Some(path) = path else {
        return Ok(ProxyConfig::default());
    };
    let raw = std::fs::read_to_string(path).with_context(|| format!("read config {path}"))?;
    serde_json::from_str(&raw).with_context(|| format!("parse config {path}"))
}

/// Periodically retire keys flagged for rotation onto healthy siblings.
fn spawn_rotation_sweeper(pool: Arc<KeyPool>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(ROTATION_SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            for outcome in pool.rotation_sweep().await {
                if outcome.rotated {
                    tracing::info!(
                        old_key = outcome.flagged,
                        new_key = ?outcome.replacement,
                        provider = %outcome.provider,
                        "rotation sweep rotated key"
                    );
                } else {
                    tracing::warn!(
                        key = outcome.flagged,
                        provider = %outcome.provider,
                        reason = %outcome.reason,
                        "rotation sweep skipped key"
                    );
                }
            }
        }
    });
}

/// Periodically write live key statistics back to storage. Best effort;
/// a failed flush is retried on the next tick.
fn spawn_stats_flusher(storage: Arc<SqlStorage>, pool: Arc<KeyPool>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(STATS_FLUSH_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            for key in pool.snapshot().await {
                if key.requests_count == 0 {
                    continue;
                }
                if let Err(err) = storage.persist_key_stats(&key).await {
                    tracing::warn!(key_id = key.id, %err, "stats flush failed");
                }
            }
        }
    });
}
