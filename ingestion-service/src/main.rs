use anyhow::Result;
use ingestion_service::{
    clock::{Clock, SystemClock},
    config::AppConfig,
    metrics_server, observability,
    pipeline::Pipeline,
    scheduler::run_periodic,
    sinks::{AtgExporter, LogStore, RetentionSweeper},
    sources::{
        webhook::{self, WebhookState},
        HttpTokenEndpoint, PollClient, TokenManager,
    },
};
use sqlx::postgres::PgPoolOptions;
use std::{sync::Arc, time::Duration};
use telemetry_store::{PgStore, Store};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let cfg = AppConfig::load()?;
    let cancel = CancellationToken::new();

    if let Some(metrics_cfg) = &cfg.metrics {
        metrics_server::init(&metrics_cfg.bind_addr, cancel.clone())?;
    }

    // Schema is applied out-of-band from telemetry-store/sql/schema/.
    let pool = PgPoolOptions::new()
        .max_connections(cfg.database.max_connections)
        .connect(&cfg.database.uri)
        .await?;
    let store: Arc<dyn Store> = Arc::new(PgStore::new(pool));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let log = Arc::new(LogStore::new(&cfg.log_store.dir));
    let pipeline = Arc::new(Pipeline::new(store.clone(), log.clone()));

    let exporter = Arc::new(AtgExporter::new(cfg.export.clone(), store.clone(), clock.clone())?);
    let endpoint = Arc::new(HttpTokenEndpoint::new(
        cfg.oauth.clone(),
        Duration::from_secs(cfg.vendor.timeout_secs),
    )?);
    let tokens = Arc::new(TokenManager::new(&cfg.oauth, endpoint, clock.clone()));
    let poll = Arc::new(PollClient::new(
        cfg.vendor.clone(),
        tokens,
        pipeline.clone(),
        Some(exporter),
        clock.clone(),
    )?);
    let sweeper = Arc::new(RetentionSweeper::new(log, cfg.log_store.retention_days, clock.clone()));

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for shutdown signal");
            return;
        }
        tracing::info!("shutdown requested");
        shutdown.cancel();
    });

    let app = webhook::router(
        WebhookState::new(pipeline, &cfg.webhook.secret, cfg.webhook.history_limit, clock),
        cfg.webhook.max_body_bytes,
    );
    if cfg.webhook.secret.is_empty() {
        tracing::warn!("push webhook secret not configured; signatures are not checked");
    }

    // A server that cannot start takes the background tasks down with it.
    let server = async {
        let result = webhook::serve(&cfg.webhook.bind_addr, app, cancel.clone()).await;
        cancel.cancel();
        result
    };

    let poll_task = async {
        if cfg.poll.enabled {
            poll.clone().run(cfg.poll.interval(), cancel.clone()).await;
        } else {
            tracing::info!("vendor poll disabled");
        }
    };

    let sweep_period = Duration::from_secs(cfg.log_store.sweep_interval_hours.max(1) * 3600);
    let sweep_task = run_periodic("log-retention", sweep_period, cancel.clone(), || {
        let sweeper = sweeper.clone();
        async move {
            if let Err(e) = sweeper.sweep().await {
                tracing::error!(error = %e, "log retention sweep failed");
            }
        }
    });

    let (server_result, (), ()) = tokio::join!(server, poll_task, sweep_task);
    server_result?;

    tracing::info!("ingestion service stopped");
    Ok(())
}
