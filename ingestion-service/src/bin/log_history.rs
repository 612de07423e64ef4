use anyhow::{anyhow, bail, Result};
use ingestion_service::{
    config::AppConfig,
    observability,
    sinks::{LogStore, TimeRange},
    transform::parse_timestamp,
};
use std::env;

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        bail!("usage: log_history <device_id> [limit] [start] [end]");
    }
    let device_id: i64 = args[1]
        .parse()
        .map_err(|e| anyhow!("invalid device id '{}': {e}", args[1]))?;

    let cfg = AppConfig::load()?;

    let limit = match args.get(2) {
        Some(raw) => raw.parse().map_err(|e| anyhow!("invalid limit '{raw}': {e}"))?,
        None => cfg.webhook.history_limit,
    };
    let bound = |idx: usize| -> Result<_> {
        args.get(idx)
            .map(|raw| parse_timestamp(raw).ok_or_else(|| anyhow!("invalid timestamp '{raw}'")))
            .transpose()
    };
    let range = TimeRange {
        start: bound(3)?,
        end: bound(4)?,
    };

    let log = LogStore::new(&cfg.log_store.dir);
    let query = log.read(device_id, range, limit).await?;

    for record in &query.records {
        println!("{}", serde_json::to_string(record)?);
    }
    if query.skipped > 0 {
        eprintln!("{} malformed line(s) skipped", query.skipped);
    }

    Ok(())
}
