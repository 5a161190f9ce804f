//! Exchange rate refresh: the only writer of the currency table.
//!
//! Rates are fetched from an HTTP endpoint that answers
//! `GET {rates_url}?base=RUB&symbols=USD,EUR,CNY` with
//! `{"success": true, "rates": {"USD": 0.011, "EUR": 0.0102, "CNY": 0.078}}`, i.e. units of each
//! currency per one unit of the reference currency. The reference currency always keeps rate 1.

use crate::error::{ErrorType, IntoResult};
use crate::model::Currency;
use crate::store::CurrencyTable;
use crate::{Error, Result};
use anyhow::Context;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument, Span};
use url::Url;

#[derive(Debug, Deserialize)]
struct RatesResponse {
    success: bool,
    #[serde(default)]
    rates: HashMap<String, f64>,
}

pub struct RateFetcher {
    client: reqwest::Client,
    url: Url,
    /// Configured currency codes; the index of a code is its currency id and index 0 is the
    /// reference currency.
    currencies: Vec<String>,
    table: Arc<dyn CurrencyTable>,
    span: Span,
}

impl RateFetcher {
    pub fn new(
        url: Url,
        currencies: Vec<String>,
        timeout: Duration,
        table: Arc<dyn CurrencyTable>,
        span: Span,
    ) -> Result<Self> {
        if currencies.is_empty() {
            return Err(Error::Config(anyhow::anyhow!("No currencies configured")));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Unable to build HTTP client")
            .pub_result(ErrorType::Internal)?;
        Ok(Self {
            client,
            url,
            currencies,
            table,
            span,
        })
    }

    fn reference(&self) -> &str {
        &self.currencies[0]
    }

    /// Fetches current rates and writes them to the currency table. Returns the number of
    /// currencies written. On any failure the table is left untouched.
    pub async fn refresh(&self) -> Result<usize> {
        async {
            let rates = self.fetch().await?;
            let mut batch = Vec::with_capacity(self.currencies.len());
            for (id, code) in self.currencies.iter().enumerate() {
                let rate = if id == 0 {
                    1.0
                } else {
                    match rates.get(code) {
                        Some(rate) if rate.is_finite() && *rate > 0.0 => *rate,
                        Some(rate) => {
                            warn!(currency = %code, "Ignoring invalid rate {rate}");
                            continue;
                        }
                        None => {
                            warn!(currency = %code, "No rate in response");
                            continue;
                        }
                    }
                };
                batch.push(Currency::new(id as i64, code.clone(), rate));
            }
            self.table.upsert_rates(&batch).await?;
            info!(count = batch.len(), "Refreshed exchange rates");
            Ok::<_, Error>(batch.len())
        }
        .instrument(self.span.clone())
        .await
    }

    async fn fetch(&self) -> Result<HashMap<String, f64>> {
        let symbols = self.currencies[1..].join(",");
        let mut url = self.url.clone();
        url.query_pairs_mut()
            .append_pair("base", self.reference())
            .append_pair("symbols", &symbols);
        debug!("Fetching exchange rates from {url}");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("Exchange rate request failed")
            .pub_result(ErrorType::Transport)?
            .error_for_status()
            .context("Exchange rate service returned an error")
            .pub_result(ErrorType::Transport)?;
        let body: RatesResponse = response
            .json()
            .await
            .context("Invalid exchange rate response")
            .pub_result(ErrorType::Transport)?;
        if !body.success {
            return Err(Error::ConversionFailure(
                "exchange rate service reported failure".to_string(),
            ));
        }
        Ok(body.rates)
    }

    /// Refreshes immediately and then every `interval` until `cancel` fires. Failures are logged
    /// and the previous rates stay in place.
    pub async fn run(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.refresh().await {
                        warn!(parent: &self.span, "Exchange rate refresh failed: {e}");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::TestEnv;
    use axum::extract::Query;
    use axum::routing::get;
    use axum::{Json, Router};
    use tokio::net::TcpListener;

    async fn serve(router: Router) -> (Url, CancellationToken) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let shutdown = cancel.clone();
        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
                .unwrap();
        });
        (Url::parse(&format!("http://{addr}/latest")).unwrap(), cancel)
    }

    fn fetcher(env: &TestEnv, url: Url) -> RateFetcher {
        let currencies = env.config().currencies().to_vec();
        RateFetcher::new(
            url,
            currencies,
            Duration::from_secs(5),
            env.currencies(),
            Span::none(),
        )
        .unwrap()
    }

    async fn rates(Query(params): Query<HashMap<String, String>>) -> Json<serde_json::Value> {
        assert_eq!(params.get("base").map(String::as_str), Some("RUB"));
        assert_eq!(params.get("symbols").map(String::as_str), Some("USD,EUR,CNY"));
        Json(serde_json::json!({
            "success": true,
            "rates": {"USD": 0.011, "EUR": 0.0102, "RUB": 3.0}
        }))
    }

    #[tokio::test]
    async fn test_refresh_writes_known_rates() {
        let env = TestEnv::new().await;
        let (url, cancel) = serve(Router::new().route("/latest", get(rates))).await;

        let written = fetcher(&env, url).refresh().await.unwrap();
        // CNY is missing from the response and keeps its old rate
        assert_eq!(written, 3);
        let table = env.db().currencies().await.unwrap();
        assert_eq!(table[0], Currency::new(0, "RUB", 1.0));
        assert_eq!(table[1], Currency::new(1, "USD", 0.011));
        assert_eq!(table[2], Currency::new(2, "EUR", 0.0102));
        assert_eq!(table[3], Currency::new(3, "CNY", 1.0));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_failed_refresh_leaves_table_untouched() {
        let env = TestEnv::new().await;
        env.set_rate("USD", 0.02).await;
        let router = Router::new()
            .route(
                "/latest",
                get(|| async { Json(serde_json::json!({"success": false})) }),
            )
            .route(
                "/broken",
                get(|| async { (axum::http::StatusCode::BAD_GATEWAY, "upstream down") }),
            );
        let (url, cancel) = serve(router).await;

        let err = fetcher(&env, url.clone()).refresh().await.unwrap_err();
        assert!(matches!(err, Error::ConversionFailure(_)));

        let broken = url.join("/broken").unwrap();
        let err = fetcher(&env, broken).refresh().await.unwrap_err();
        assert!(matches!(err, Error::TransportUnavailable(_)));

        assert_eq!(env.db().currency(1).await.unwrap().rate, 0.02);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_timeout_is_respected() {
        let env = TestEnv::new().await;
        let router = Router::new().route(
            "/latest",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Json(serde_json::json!({"success": true, "rates": {}}))
            }),
        );
        let (url, cancel) = serve(router).await;
        let fetcher = RateFetcher::new(
            url,
            env.config().currencies().to_vec(),
            Duration::from_millis(50),
            env.currencies(),
            Span::none(),
        )
        .unwrap();
        let err = fetcher.refresh().await.unwrap_err();
        assert!(matches!(err, Error::TransportUnavailable(_)));
        cancel.cancel();
    }
}
