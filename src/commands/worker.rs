use crate::args::WorkerArgs;
use crate::commands::currency::rate_fetcher;
use crate::commands::{interrupt, ledger, Out};
use crate::ledger::Ledger;
use crate::model::start_of_next_month;
use crate::transport::callback::HttpCallbackClient;
use crate::transport::queue::SqliteQueue;
use crate::worker::ReportWorker;
use crate::{Config, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn};

/// Runs the report worker until Ctrl-C. Optionally also keeps exchange rates fresh and restores
/// every user's limit when a new month starts.
pub async fn worker(config: &Config, args: &WorkerArgs) -> Result<Out<u64>> {
    let cancel = interrupt();
    let ledger = ledger(config);
    let mut background = Vec::new();

    if args.refresh_rates() {
        let fetcher = rate_fetcher(config)?;
        let interval = config.rates_refresh();
        let token = cancel.clone();
        background.push(tokio::spawn(async move { fetcher.run(interval, token).await }));
    }
    if args.reset_limits() {
        let ledger = ledger.clone();
        let token = cancel.clone();
        background.push(tokio::spawn(monthly_limit_reset(ledger, token)));
    }

    let callback = HttpCallbackClient::new(config.callback_addr(), config.request_timeout())?;
    let worker = ReportWorker::new(
        ledger,
        Arc::new(SqliteQueue::new(config.db().clone())),
        Arc::new(callback),
        info_span!("worker"),
    );
    info!("Sending reports to {}", config.callback_addr());
    let result = worker.run(cancel.clone()).await;
    cancel.cancel();
    for task in background {
        if let Err(e) = task.await {
            warn!("Background task did not finish: {e}");
        }
    }
    let handled = result?;
    Ok(Out::new(format!("Handled {handled} report requests"), handled))
}

/// Restores every user's current limit at each month boundary (UTC) until `cancel` fires.
async fn monthly_limit_reset(ledger: Ledger, cancel: CancellationToken) {
    loop {
        let wait = until_next_month(Utc::now());
        debug!("Next monthly limit reset in {}s", wait.as_secs());
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(wait) => {
                if let Err(e) = ledger.reset_all_limits().await {
                    warn!("Monthly limit reset failed: {e}");
                }
            }
        }
    }
}

fn until_next_month(now: DateTime<Utc>) -> Duration {
    (start_of_next_month(now) - now)
        .to_std()
        .unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_until_next_month() {
        let now = Utc.with_ymd_and_hms(2024, 2, 28, 12, 0, 0).unwrap();
        assert_eq!(until_next_month(now), Duration::from_secs(36 * 3600));

        let now = Utc.with_ymd_and_hms(2024, 12, 31, 23, 59, 59).unwrap();
        assert_eq!(until_next_month(now), Duration::from_secs(1));
    }
}
