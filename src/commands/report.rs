use crate::args::ReportArgs;
use crate::commands::{interrupt, ledger, report_cache, Out};
use crate::conversion::ConversionService;
use crate::model::{Amount, Period};
use crate::orchestrator::ReportOrchestrator;
use crate::store::{CurrencyTable, LedgerStore};
use crate::transport::callback::spawn_server;
use crate::transport::queue::SqliteQueue;
use crate::worker::ReportWorker;
use crate::{Config, Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info_span, warn};

/// A spending report as printed by `spendbook report`.
#[derive(Debug, Clone, Serialize)]
pub struct ReportOutput {
    pub user_id: i64,
    pub period: Period,
    pub since: DateTime<Utc>,
    pub currency: String,
    pub categories: BTreeMap<String, Amount>,
    pub total: Amount,
}

/// Prints the user's spending per category since the start of the requested period.
///
/// The report comes from the cache when possible. Otherwise a request is queued and this process
/// serves the callback endpoint until a worker answers, Ctrl-C is pressed, or the report timeout
/// elapses. With `--local`, a worker runs inside this process instead.
pub async fn report(config: &Config, args: &ReportArgs) -> Result<Out<ReportOutput>> {
    let user_id = args.user();
    let since = args.period().window_start(Utc::now());
    let db = Arc::new(config.db().clone());
    let queue = SqliteQueue::new(config.db().clone());
    // the in-process worker must only answer this process's own requests
    let queue = if args.local() { queue.private() } else { queue };
    let orchestrator = ReportOrchestrator::new(
        db.clone(),
        ConversionService::new(db.clone()),
        report_cache(config),
        Arc::new(queue.clone()),
        info_span!("report", user_id),
    )
    .with_cache_ttl(config.cache_ttl())
    .with_timeout(config.report_timeout());

    let stop = CancellationToken::new();
    let background: JoinHandle<Result<()>> = if args.local() {
        let worker = ReportWorker::new(
            ledger(config),
            Arc::new(queue),
            Arc::new(orchestrator.clone()),
            info_span!("worker"),
        );
        let token = stop.clone();
        tokio::spawn(async move { worker.run(token).await.map(|_| ()) })
    } else {
        let (_, server) =
            spawn_server(config.callback_addr(), Arc::new(orchestrator.clone()), stop.clone())
                .await?;
        server
    };

    let result = orchestrator.get_report(user_id, since, &interrupt()).await;
    stop.cancel();
    match background.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Background task failed: {e}"),
        Err(e) => warn!("Background task did not finish: {e}"),
    }
    let report = result?;

    let user = db.user(user_id).await?;
    let currency = db.currency(user.currency_id).await?.code;
    let total = report
        .values()
        .try_fold(0i64, |acc, v| acc.checked_add(*v))
        .ok_or_else(|| Error::ConversionFailure("report total is out of range".to_string()))?;
    let categories: BTreeMap<String, Amount> = report
        .into_iter()
        .map(|(name, minor)| (name, Amount::from_minor(minor)))
        .collect();

    let mut message = format!("Expenses since {} ({})", since.format("%Y-%m-%d"), args.period());
    if categories.is_empty() {
        message.push_str(":\nnothing recorded");
    } else {
        for (name, amount) in &categories {
            message.push_str(&format!("\n{name}: {amount} {currency}"));
        }
    }
    message.push_str(&format!("\ntotal: {} {currency}", Amount::from_minor(total)));

    Ok(Out::new(
        message,
        ReportOutput {
            user_id,
            period: args.period(),
            since,
            currency,
            categories,
            total: Amount::from_minor(total),
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ReportCache;
    use crate::test::TestEnv;
    use chrono::Duration;

    #[tokio::test]
    async fn test_local_report() {
        let env = TestEnv::new().await;
        let config = env.config();
        env.add_user(1, 1_000_000).await;
        let now = Utc::now();
        env.insert_expense(1, "food", 1250, now).await;
        env.insert_expense(1, "food", 250, now).await;
        env.insert_expense(1, "rent", 50_000, now).await;
        env.insert_expense(1, "old", 999, now - Duration::days(400)).await;

        let out = report(&config, &ReportArgs::new(1, Period::Month, true))
            .await
            .unwrap();
        let report = out.structure().unwrap();
        assert_eq!(report.currency, "RUB");
        assert_eq!(report.categories.len(), 2);
        assert_eq!(report.categories["food"], Amount::from_minor(1500));
        assert_eq!(report.categories["rent"], Amount::from_minor(50_000));
        assert_eq!(report.total, Amount::from_minor(51_500));
        assert!(out.message().contains("food: 15.00 RUB"));

        let cached = report_cache(&config).get(1, report.since).await.unwrap();
        assert_eq!(cached.map(|r| r.len()), Some(2));
    }

    #[tokio::test]
    async fn test_report_of_unknown_user() {
        let env = TestEnv::new().await;
        let err = report(&env.config(), &ReportArgs::new(9, Period::All, true))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UserNotFound(9)));
    }
}
