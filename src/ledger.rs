//! The expense ledger: the single source of truth for expenses and monthly limits.
//!
//! Amounts come in and go out in the user's display currency and are stored in minor units of the
//! reference currency. Expenses dated in the current calendar month (UTC) are charged against the
//! user's monthly limit; older and future-month expenses are recorded without a limit check.
//!
//! Every mutation of a user's expenses or currency invalidates all of their cached reports. A
//! failed invalidation is logged and does not undo the mutation.

use crate::cache::ReportCache;
use crate::conversion::{from_base, ConversionService};
use crate::model::{start_of_month, start_of_next_month, Amount, Currency, ExpenseRow, NewExpense};
use crate::store::{CurrencyTable, LedgerStore};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn, Instrument, Span};

const DEFAULT_MONTH_LIMIT: i64 = 1_000_000;

/// A user's limits expressed in their display currency.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct LimitStatus {
    pub currency: String,
    pub default_limit: Amount,
    pub remaining: Amount,
}

#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn LedgerStore>,
    currencies: Arc<dyn CurrencyTable>,
    conversion: ConversionService,
    cache: Arc<dyn ReportCache>,
    default_month_limit: i64,
    span: Span,
}

impl Ledger {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        currencies: Arc<dyn CurrencyTable>,
        cache: Arc<dyn ReportCache>,
        span: Span,
    ) -> Self {
        Self {
            store,
            conversion: ConversionService::new(currencies.clone()),
            currencies,
            cache,
            default_month_limit: DEFAULT_MONTH_LIMIT,
            span,
        }
    }

    /// The limit given to users created from now on, in reference minor units.
    pub fn with_default_month_limit(mut self, limit: i64) -> Self {
        self.default_month_limit = limit;
        self
    }

    pub fn conversion(&self) -> &ConversionService {
        &self.conversion
    }

    /// Registers the user. Returns false if they already existed, in which case nothing changes.
    pub async fn add_user(&self, user_id: i64) -> Result<bool> {
        let created = self
            .store
            .add_user(user_id, self.default_month_limit)
            .instrument(self.span.clone())
            .await?;
        if created {
            info!(parent: &self.span, user_id, "Added user");
        }
        Ok(created)
    }

    /// Erases the user with all their categories and expenses.
    pub async fn reset_user(&self, user_id: i64) -> Result<()> {
        async {
            self.store.delete_user(user_id).await?;
            self.invalidate(user_id).await;
            info!(user_id, "Reset user");
            Ok::<_, Error>(())
        }
        .instrument(self.span.clone())
        .await
    }

    /// Creates a category. Returns false if the user already had one with this name.
    pub async fn add_category(&self, user_id: i64, name: &str) -> Result<bool> {
        let created = self
            .store
            .add_category(user_id, name.trim())
            .instrument(self.span.clone())
            .await?;
        debug!(parent: &self.span, user_id, name, created, "Add category");
        Ok(created)
    }

    /// Records an expense of `amount` in the user's display currency under an existing category.
    ///
    /// # Errors
    /// - `InvalidAmount` unless the amount is positive in both display and reference currency.
    /// - `CategoryNotFound` if the user has no such category.
    /// - `LimitExceeded` if the expense is dated this month and would overdraw the monthly limit.
    ///   Nothing is written in that case.
    pub async fn write_expense(
        &self,
        user_id: i64,
        category: &str,
        amount: Amount,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        self.write_expense_at(user_id, category, amount, timestamp, Utc::now())
            .instrument(self.span.clone())
            .await
    }

    async fn write_expense_at(
        &self,
        user_id: i64,
        category: &str,
        amount: Amount,
        timestamp: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if !amount.is_positive() {
            return Err(Error::InvalidAmount(format!("{amount} is not positive")));
        }
        let user = self.store.user(user_id).await?;
        let category = category.trim();
        let category_id = self
            .store
            .category_id(user_id, category)
            .await?
            .ok_or_else(|| Error::CategoryNotFound(category.to_string()))?;

        let base = self
            .conversion
            .to_base(amount.minor_units(), user.currency_id)
            .await?;
        if base <= 0 {
            return Err(Error::InvalidAmount(format!(
                "{amount} is too small to record"
            )));
        }

        let enforce_limit = timestamp >= start_of_month(now) && timestamp < start_of_next_month(now);
        let expense = NewExpense {
            user_id,
            category_id,
            timestamp,
            amount: base,
        };
        self.store.insert_expense(&expense, enforce_limit).await?;
        debug!(user_id, category, base, enforce_limit, "Recorded expense");

        self.invalidate(user_id).await;
        Ok(())
    }

    /// Raw expense rows of the user with `ts >= window_start`, amounts in reference minor units.
    pub async fn read_expenses(
        &self,
        user_id: i64,
        window_start: DateTime<Utc>,
    ) -> Result<Vec<ExpenseRow>> {
        self.store
            .expenses_since(user_id, window_start)
            .instrument(self.span.clone())
            .await
    }

    /// Sets the user's default and current monthly limit to `amount` in their display currency.
    pub async fn set_limit(&self, user_id: i64, amount: Amount) -> Result<()> {
        async {
            if !amount.is_positive() {
                return Err(Error::InvalidAmount(format!(
                    "limit {amount} must be at least 0.01"
                )));
            }
            let user = self.store.user(user_id).await?;
            let base = self
                .conversion
                .to_base(amount.minor_units(), user.currency_id)
                .await?;
            if base <= 0 {
                return Err(Error::InvalidAmount(format!("limit {amount} is too small")));
            }
            self.store.set_limit(user_id, base).await?;
            info!(user_id, base, "Set monthly limit");
            Ok::<_, Error>(())
        }
        .instrument(self.span.clone())
        .await
    }

    /// Restores the user's current limit to their default limit.
    pub async fn reset_limit(&self, user_id: i64) -> Result<()> {
        self.store
            .reset_limit(user_id)
            .instrument(self.span.clone())
            .await?;
        info!(parent: &self.span, user_id, "Reset monthly limit");
        Ok(())
    }

    /// Restores every user's current limit. This is the monthly job; it is idempotent.
    pub async fn reset_all_limits(&self) -> Result<u64> {
        let count = self
            .store
            .reset_all_limits()
            .instrument(self.span.clone())
            .await?;
        info!(parent: &self.span, count, "Reset all monthly limits");
        Ok(count)
    }

    /// The user's limits converted to their display currency.
    pub async fn limit_status(&self, user_id: i64) -> Result<LimitStatus> {
        async {
            let user = self.store.user(user_id).await?;
            let currency = self.currencies.currency(user.currency_id).await?;
            let rate = self.conversion.rate(user.currency_id).await?;
            Ok::<_, Error>(LimitStatus {
                currency: currency.code,
                default_limit: Amount::from_minor(from_base(user.default_month_limit, rate)?),
                remaining: Amount::from_minor(from_base(user.current_month_limit, rate)?),
            })
        }
        .instrument(self.span.clone())
        .await
    }

    /// Switches the user's display currency and drops their cached reports.
    pub async fn change_currency(&self, user_id: i64, code: &str) -> Result<Currency> {
        async {
            let currency = self.currencies.currency_by_code(code).await?;
            self.store.set_currency(user_id, currency.id).await?;
            self.invalidate(user_id).await;
            info!(user_id, currency = %currency.code, "Changed currency");
            Ok::<_, Error>(currency)
        }
        .instrument(self.span.clone())
        .await
    }

    async fn invalidate(&self, user_id: i64) {
        match self.cache.invalidate_all(user_id).await {
            Ok(n) => debug!(user_id, entries = n, "Invalidated cached reports"),
            Err(e) => warn!(user_id, "Unable to invalidate cached reports: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryReportCache;
    use crate::model::Report;
    use crate::test::TestEnv;
    use chrono::{Duration, TimeZone};
    use std::str::FromStr;

    fn amount(s: &str) -> Amount {
        Amount::from_str(s).unwrap()
    }

    fn mid_october() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 10, 15, 12, 0, 0).unwrap()
    }

    async fn env_with_food(limit: i64) -> (TestEnv, Ledger) {
        let env = TestEnv::new().await;
        let ledger = env.ledger().with_default_month_limit(limit);
        assert!(ledger.add_user(1).await.unwrap());
        assert!(ledger.add_category(1, "food").await.unwrap());
        (env, ledger)
    }

    #[tokio::test]
    async fn test_limit_exceeded_scenario() {
        let (env, ledger) = env_with_food(1000).await;
        let now = mid_october();
        ledger
            .write_expense_at(1, "food", Amount::from_minor(700), now, now)
            .await
            .unwrap();
        assert_eq!(env.db().user(1).await.unwrap().current_month_limit, 300);

        let err = ledger
            .write_expense_at(1, "food", Amount::from_minor(400), now, now)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LimitExceeded));
        assert_eq!(env.db().user(1).await.unwrap().current_month_limit, 300);
        let rows = ledger
            .read_expenses(1, DateTime::UNIX_EPOCH)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].amount, 700);
    }

    #[tokio::test]
    async fn test_historical_expenses_are_exempt() {
        let (env, ledger) = env_with_food(1000).await;
        let now = mid_october();
        let last_month = Utc.with_ymd_and_hms(2025, 9, 30, 23, 59, 59).unwrap();
        ledger
            .write_expense_at(1, "food", Amount::from_minor(1_000_000), last_month, now)
            .await
            .unwrap();
        let next_month = Utc.with_ymd_and_hms(2025, 11, 1, 0, 0, 0).unwrap();
        ledger
            .write_expense_at(1, "food", Amount::from_minor(5000), next_month, now)
            .await
            .unwrap();
        assert_eq!(env.db().user(1).await.unwrap().current_month_limit, 1000);

        // first second of the month is charged
        let first = Utc.with_ymd_and_hms(2025, 10, 1, 0, 0, 0).unwrap();
        assert!(matches!(
            ledger
                .write_expense_at(1, "food", Amount::from_minor(1001), first, now)
                .await,
            Err(Error::LimitExceeded)
        ));
    }

    #[tokio::test]
    async fn test_write_expense_uses_the_clock() {
        let (env, ledger) = env_with_food(1000).await;
        ledger
            .write_expense(1, "food", amount("3.00"), Utc::now())
            .await
            .unwrap();
        assert_eq!(env.db().user(1).await.unwrap().current_month_limit, 700);
        ledger
            .write_expense(1, "food", amount("50"), Utc::now() - Duration::days(62))
            .await
            .unwrap();
        assert_eq!(env.db().user(1).await.unwrap().current_month_limit, 700);
    }

    #[tokio::test]
    async fn test_concurrent_writes_are_linearized() {
        let (env, ledger) = env_with_food(1000).await;
        let now = mid_october();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger
                    .write_expense_at(1, "food", Amount::from_minor(250), now, now)
                    .await
            }));
        }
        let mut ok = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(()) => ok += 1,
                Err(Error::LimitExceeded) => {}
                Err(e) => panic!("{e}"),
            }
        }
        assert_eq!(ok, 4);
        assert_eq!(env.db().user(1).await.unwrap().current_month_limit, 0);
        assert_eq!(
            ledger
                .read_expenses(1, DateTime::UNIX_EPOCH)
                .await
                .unwrap()
                .len(),
            4
        );
    }

    #[tokio::test]
    async fn test_amounts_are_stored_in_the_reference_currency() {
        let (env, ledger) = env_with_food(1_000_000).await;
        env.set_rate("USD", 0.5).await;
        ledger.change_currency(1, "USD").await.unwrap();
        let now = mid_october();
        // 10.00 USD at 0.5 USD per RUB is 20.00 RUB
        ledger
            .write_expense_at(1, "food", amount("10"), now, now)
            .await
            .unwrap();
        let rows = ledger.read_expenses(1, DateTime::UNIX_EPOCH).await.unwrap();
        assert_eq!(rows[0].amount, 2000);
        assert_eq!(
            env.db().user(1).await.unwrap().current_month_limit,
            1_000_000 - 2000
        );
    }

    #[tokio::test]
    async fn test_input_errors() {
        let (env, ledger) = env_with_food(1000).await;
        let now = mid_october();
        assert!(matches!(
            ledger.write_expense_at(1, "rent", amount("1"), now, now).await,
            Err(Error::CategoryNotFound(name)) if name == "rent"
        ));
        assert!(matches!(
            ledger.write_expense_at(1, "food", amount("0"), now, now).await,
            Err(Error::InvalidAmount(_))
        ));
        assert!(matches!(
            ledger.write_expense_at(1, "food", amount("-5"), now, now).await,
            Err(Error::InvalidAmount(_))
        ));
        assert!(matches!(
            ledger.write_expense_at(2, "food", amount("1"), now, now).await,
            Err(Error::UserNotFound(2))
        ));
        assert!(matches!(
            ledger.change_currency(1, "XYZ").await,
            Err(Error::CurrencyNotFound(_))
        ));

        // a rate that makes the amount vanish in the reference currency
        env.set_rate("USD", 1000.0).await;
        ledger.change_currency(1, "USD").await.unwrap();
        assert!(matches!(
            ledger.write_expense_at(1, "food", amount("0.05"), now, now).await,
            Err(Error::InvalidAmount(_))
        ));

        // an unusable rate is a conversion failure, never a silent rate of 1
        env.set_rate("EUR", 1.0).await;
        ledger.change_currency(1, "EUR").await.unwrap();
        sqlx::query("UPDATE currency SET rate = 0 WHERE code = 'EUR'")
            .execute(env.db().pool())
            .await
            .unwrap();
        assert!(matches!(
            ledger.write_expense_at(1, "food", amount("1"), now, now).await,
            Err(Error::ConversionFailure(_))
        ));
    }

    async fn seed(cache: &MemoryReportCache, month: DateTime<Utc>) {
        let ttl = std::time::Duration::from_secs(600);
        cache.set(1, month, &Report::new(), ttl).await.unwrap();
        cache
            .set(1, DateTime::UNIX_EPOCH, &Report::new(), ttl)
            .await
            .unwrap();
        cache.set(2, month, &Report::new(), ttl).await.unwrap();
    }

    #[tokio::test]
    async fn test_mutations_invalidate_cached_reports() {
        let (env, ledger) = env_with_food(1_000_000).await;
        let cache = env.cache();
        let month = Utc.with_ymd_and_hms(2025, 10, 1, 0, 0, 0).unwrap();

        seed(&cache, month).await;
        ledger
            .write_expense(1, "food", amount("1"), Utc::now())
            .await
            .unwrap();
        assert!(cache.get(1, month).await.unwrap().is_none());
        assert!(cache.get(1, DateTime::UNIX_EPOCH).await.unwrap().is_none());
        assert!(cache.get(2, month).await.unwrap().is_some());

        seed(&cache, month).await;
        ledger.change_currency(1, "EUR").await.unwrap();
        assert!(cache.get(1, month).await.unwrap().is_none());
        assert!(cache.get(1, DateTime::UNIX_EPOCH).await.unwrap().is_none());

        seed(&cache, month).await;
        ledger.reset_user(1).await.unwrap();
        assert!(cache.get(1, month).await.unwrap().is_none());

        // a rejected write leaves the cache alone
        seed(&cache, month).await;
        ledger.add_user(1).await.unwrap();
        assert!(ledger
            .write_expense(1, "food", amount("1"), Utc::now())
            .await
            .is_err());
        assert!(cache.get(1, month).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_limits() {
        let (env, ledger) = env_with_food(1000).await;
        env.set_rate("USD", 0.5).await;
        ledger.change_currency(1, "USD").await.unwrap();

        // 5.00 USD is 10.00 RUB
        ledger.set_limit(1, amount("5")).await.unwrap();
        let user = env.db().user(1).await.unwrap();
        assert_eq!((user.default_month_limit, user.current_month_limit), (1000, 1000));
        let status = ledger.limit_status(1).await.unwrap();
        assert_eq!(status.currency, "USD");
        assert_eq!(status.remaining, amount("5"));

        let now = Utc::now();
        ledger.write_expense(1, "food", amount("2"), now).await.unwrap();
        assert_eq!(ledger.limit_status(1).await.unwrap().remaining, amount("3"));
        ledger.reset_limit(1).await.unwrap();
        assert_eq!(ledger.limit_status(1).await.unwrap().remaining, amount("5"));

        ledger.write_expense(1, "food", amount("2"), now).await.unwrap();
        ledger.add_user(2).await.unwrap();
        assert_eq!(ledger.reset_all_limits().await.unwrap(), 2);
        assert_eq!(ledger.reset_all_limits().await.unwrap(), 2);
        assert_eq!(ledger.limit_status(1).await.unwrap().remaining, amount("5"));

        assert!(matches!(
            ledger.set_limit(1, amount("0")).await,
            Err(Error::InvalidAmount(_))
        ));
    }

    #[tokio::test]
    async fn test_add_user_and_category_are_idempotent() {
        let (_env, ledger) = env_with_food(1000).await;
        assert!(!ledger.add_user(1).await.unwrap());
        assert!(!ledger.add_category(1, "food").await.unwrap());
        assert!(!ledger.add_category(1, "  food ").await.unwrap());
    }

    #[tokio::test]
    async fn test_write_expense_trims_the_category() {
        let (env, ledger) = env_with_food(1000).await;
        assert!(!ledger.add_category(1, " food").await.unwrap());
        let now = mid_october();
        ledger
            .write_expense_at(1, " food ", Amount::from_minor(250), now, now)
            .await
            .unwrap();
        assert_eq!(env.db().user(1).await.unwrap().current_month_limit, 750);
    }
}
