//! Shared test utilities for creating test environments.
//!
//! This module is only compiled when running tests (`#[cfg(test)]`).

use crate::cache::{MemoryReportCache, ReportCache};
use crate::config::ConfigFile;
use crate::db::Db;
use crate::ledger::Ledger;
use crate::model::{Currency, NewExpense};
use crate::store::{CurrencyTable, LedgerStore};
use crate::Config;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::Span;

/// Test environment that sets up a spendbook home directory with Config and database.
/// Holds TempDir to keep the directory alive for the duration of the test.
pub(crate) struct TestEnv {
    _temp_dir: TempDir,
    config: Config,
    cache: Arc<MemoryReportCache>,
}

impl TestEnv {
    /// Creates a test environment with the default currencies (RUB, USD, EUR, CNY), all at rate 1,
    /// and a callback address on an ephemeral port.
    pub async fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("spendbook");
        let config_file = ConfigFile::default().with_callback_addr("127.0.0.1:0");
        let config = Config::create_with(&root, config_file).await.unwrap();
        Self {
            _temp_dir: temp_dir,
            config,
            cache: Arc::new(MemoryReportCache::new()),
        }
    }

    /// Returns a clone of the Config.
    pub fn config(&self) -> Config {
        self.config.clone()
    }

    pub fn db(&self) -> Db {
        self.config.db().clone()
    }

    pub fn store(&self) -> Arc<dyn LedgerStore> {
        Arc::new(self.db())
    }

    pub fn currencies(&self) -> Arc<dyn CurrencyTable> {
        Arc::new(self.db())
    }

    /// The in-memory cache shared by everything built from this environment.
    pub fn cache(&self) -> Arc<MemoryReportCache> {
        self.cache.clone()
    }

    /// A ledger over this environment's database and cache.
    pub fn ledger(&self) -> Ledger {
        let cache: Arc<dyn ReportCache> = self.cache.clone();
        Ledger::new(self.store(), self.currencies(), cache, Span::none())
    }

    /// Overwrites the rate of a configured currency.
    pub async fn set_rate(&self, code: &str, rate: f64) {
        let db = self.db();
        let currency = db.currency_by_code(code).await.unwrap();
        db.upsert_rates(&[Currency::new(currency.id, code, rate)])
            .await
            .unwrap();
    }

    /// Creates a user in the reference currency with the given monthly limit.
    pub async fn add_user(&self, user_id: i64, month_limit: i64) {
        self.db().add_user(user_id, month_limit).await.unwrap();
    }

    /// Creates the category if needed and returns its id.
    pub async fn add_category(&self, user_id: i64, name: &str) -> i64 {
        let db = self.db();
        db.add_category(user_id, name).await.unwrap();
        db.category_id(user_id, name).await.unwrap().unwrap()
    }

    /// Inserts an expense directly, bypassing conversion, limits and cache invalidation.
    pub async fn insert_expense(&self, user_id: i64, category: &str, amount: i64, ts: DateTime<Utc>) {
        let category_id = self.add_category(user_id, category).await;
        let expense = NewExpense {
            user_id,
            category_id,
            timestamp: ts,
            amount,
        };
        self.db().insert_expense(&expense, false).await.unwrap();
    }
}
