use std::{future::Future, time::Duration};

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Run `task` every `period` until `cancel` fires. The first run starts
/// immediately. Cancellation is observed between runs only, so a run in
/// progress always finishes.
pub async fn run_periodic<F, Fut>(name: &'static str, period: Duration, cancel: CancellationToken, mut task: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::info!(task = name, period_secs = period.as_secs(), "periodic task started");

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => task().await,
        }
    }

    tracing::info!(task = name, "periodic task stopped");
}
