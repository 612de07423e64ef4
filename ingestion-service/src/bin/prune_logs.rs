use anyhow::Result;
use ingestion_service::{
    clock::SystemClock,
    config::AppConfig,
    observability,
    sinks::{LogStore, RetentionSweeper},
};
use std::sync::Arc;

/// One retention sweep over the device log tree, then exit.
#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let cfg = AppConfig::load()?;
    let log = Arc::new(LogStore::new(&cfg.log_store.dir));
    let sweeper = RetentionSweeper::new(log, cfg.log_store.retention_days, Arc::new(SystemClock));

    let report = sweeper.sweep().await?;
    println!(
        "removed {} file(s) older than {}, {} failed",
        report.removed,
        sweeper.cutoff(),
        report.failed
    );

    Ok(())
}
