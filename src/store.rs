//! Capability traits over the persistent stores.
//!
//! The ledger, orchestrator and worker depend only on these traits. `db::Db` implements them over
//! SQLite.

use crate::model::{Currency, ExpenseRow, NewExpense, User};
use crate::Result;
use chrono::{DateTime, Utc};

/// Exchange rates per currency. Written only by the rate refresh, read by everything else.
#[async_trait::async_trait]
pub trait CurrencyTable: Send + Sync {
    /// Returns the currency with this id, or `CurrencyNotFound`.
    async fn currency(&self, id: i64) -> Result<Currency>;

    /// Returns the currency with this code, or `CurrencyNotFound`.
    async fn currency_by_code(&self, code: &str) -> Result<Currency>;

    /// All known currencies, ordered by id.
    async fn currencies(&self) -> Result<Vec<Currency>>;

    /// Idempotent bulk upsert keyed by id.
    async fn upsert_rates(&self, batch: &[Currency]) -> Result<()>;
}

/// Users, categories and expenses.
#[async_trait::async_trait]
pub trait LedgerStore: Send + Sync {
    /// Creates the user in the reference currency with `month_limit` as both default and current
    /// limit. Returns false if the user already existed.
    async fn add_user(&self, user_id: i64, month_limit: i64) -> Result<bool>;

    /// Returns the user, or `UserNotFound`.
    async fn user(&self, user_id: i64) -> Result<User>;

    /// Deletes the user together with their categories and expenses.
    async fn delete_user(&self, user_id: i64) -> Result<()>;

    async fn set_currency(&self, user_id: i64, currency_id: i64) -> Result<()>;

    /// Sets both the default and the current monthly limit, in reference minor units.
    async fn set_limit(&self, user_id: i64, limit: i64) -> Result<()>;

    /// Sets the current monthly limit back to the default one.
    async fn reset_limit(&self, user_id: i64) -> Result<()>;

    /// Resets every user's current limit to their default. Returns the number of users touched.
    async fn reset_all_limits(&self) -> Result<u64>;

    async fn category_id(&self, user_id: i64, name: &str) -> Result<Option<i64>>;

    /// Creates the category. Returns false if the user already had one with this name.
    async fn add_category(&self, user_id: i64, name: &str) -> Result<bool>;

    /// Inserts the expense. When `enforce_limit` is set, the user's current limit is decremented
    /// by the amount in the same transaction, and the whole write is rolled back with
    /// `LimitExceeded` if the limit would go negative.
    async fn insert_expense(&self, expense: &NewExpense, enforce_limit: bool) -> Result<()>;

    /// Every expense of the user with `ts >= since`, oldest first, joined with category names.
    async fn expenses_since(&self, user_id: i64, since: DateTime<Utc>) -> Result<Vec<ExpenseRow>>;
}
