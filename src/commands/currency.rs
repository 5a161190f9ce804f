use crate::args::CurrencySetArgs;
use crate::commands::{ledger, Out};
use crate::model::Currency;
use crate::rates::RateFetcher;
use crate::store::CurrencyTable;
use crate::{Config, Result};
use std::sync::Arc;
use tracing::info_span;

pub async fn currency_list(config: &Config) -> Result<Out<Vec<Currency>>> {
    let currencies = config.db().currencies().await?;
    let lines: Vec<String> = currencies
        .iter()
        .map(|c| format!("{:>3} {} {}", c.id, c.code, c.rate))
        .collect();
    Ok(Out::new(
        format!("Currencies per 1 {}:\n{}", config.reference_currency(), lines.join("\n")),
        currencies,
    ))
}

/// Fetches exchange rates once.
pub async fn currency_refresh(config: &Config) -> Result<Out<usize>> {
    let fetcher = rate_fetcher(config)?;
    let count = fetcher.refresh().await?;
    Ok(Out::new(format!("Updated {count} exchange rates"), count))
}

pub async fn currency_set(config: &Config, args: &CurrencySetArgs) -> Result<Out<Currency>> {
    let currency = ledger(config)
        .change_currency(args.user(), args.code())
        .await?;
    Ok(Out::new(
        format!("User {} now uses {}", args.user(), currency.code),
        currency,
    ))
}

pub(super) fn rate_fetcher(config: &Config) -> Result<RateFetcher> {
    RateFetcher::new(
        config.rates_url().clone(),
        config.currencies().to_vec(),
        config.request_timeout(),
        Arc::new(config.db().clone()),
        info_span!("rates"),
    )
}
