//! This module is responsible for reading, writing and managing the SQLite database.
//!
//! `Db` is the SQLite implementation of the [`CurrencyTable`] and [`LedgerStore`] capabilities. The
//! same database file also holds the durable report request queue and the shared report cache, so
//! that the bot and worker processes only ever meet through it.

mod cache;
pub(crate) mod migrations;

pub use cache::SqliteReportCache;

use crate::error::{ErrorType, IntoResult};
use crate::model::{Currency, ExpenseRow, NewExpense, User};
use crate::store::{CurrencyTable, LedgerStore};
use crate::{Error, Result};
use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, trace};

const MAX_CONNECTIONS: u32 = 5;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct Db {
    pool: SqlitePool,
}

impl Db {
    /// - Validates that there is a SQLite file at `path`
    /// - Opens a connection pool
    /// - Updates the database schema with migrations if it is out-of-date
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(anyhow::anyhow!("Database file {} does not exist", path.display()))
                .pub_result(ErrorType::Database);
        }
        let pool = connect(path, false).await?;
        let version = migrations::version(&pool)
            .await
            .pub_result(ErrorType::Database)?;
        if version > migrations::CURRENT_VERSION {
            return Err(anyhow::anyhow!(
                "Database schema version {version} is newer than supported version {}",
                migrations::CURRENT_VERSION
            ))
            .pub_result(ErrorType::Database);
        }
        migrations::run(&pool, version, migrations::CURRENT_VERSION)
            .await
            .pub_result(ErrorType::Database)?;
        Ok(Self { pool })
    }

    /// - Validates that no file currently exists at `path`
    /// - Creates a new SQLite file at `path`
    /// - Initializes the database schema
    pub async fn init(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            return Err(anyhow::anyhow!("Database file {} already exists", path.display()))
                .pub_result(ErrorType::Database);
        }
        let pool = connect(path, true).await?;
        async {
            migrations::bootstrap(&pool).await?;
            migrations::run(&pool, 0, migrations::CURRENT_VERSION).await
        }
        .await
        .pub_result(ErrorType::Database)?;
        debug!("Created database at {}", path.display());
        Ok(Self { pool })
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

async fn connect(path: &Path, create: bool) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(create)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(BUSY_TIMEOUT)
        .foreign_keys(true);
    SqlitePoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .connect_with(options)
        .await
        .with_context(|| format!("Unable to open database {}", path.display()))
        .pub_result(ErrorType::Database)
}

fn is_foreign_key_violation(e: &sqlx::Error) -> bool {
    e.to_string().contains("FOREIGN KEY constraint failed")
}

#[async_trait::async_trait]
impl CurrencyTable for Db {
    async fn currency(&self, id: i64) -> Result<Currency> {
        let row: Option<(i64, String, f64)> =
            sqlx::query_as("SELECT id, code, rate FROM currency WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .context("Failed to query currency")
                .pub_result(ErrorType::Database)?;
        let (id, code, rate) = row.ok_or_else(|| Error::CurrencyNotFound(id.to_string()))?;
        Ok(Currency::new(id, code, rate))
    }

    async fn currency_by_code(&self, code: &str) -> Result<Currency> {
        let row: Option<(i64, String, f64)> =
            sqlx::query_as("SELECT id, code, rate FROM currency WHERE code = ?")
                .bind(code)
                .fetch_optional(&self.pool)
                .await
                .context("Failed to query currency")
                .pub_result(ErrorType::Database)?;
        let (id, code, rate) = row.ok_or_else(|| Error::CurrencyNotFound(code.to_string()))?;
        Ok(Currency::new(id, code, rate))
    }

    async fn currencies(&self) -> Result<Vec<Currency>> {
        let rows: Vec<(i64, String, f64)> =
            sqlx::query_as("SELECT id, code, rate FROM currency ORDER BY id")
                .fetch_all(&self.pool)
                .await
                .context("Failed to list currencies")
                .pub_result(ErrorType::Database)?;
        Ok(rows
            .into_iter()
            .map(|(id, code, rate)| Currency::new(id, code, rate))
            .collect())
    }

    async fn upsert_rates(&self, batch: &[Currency]) -> Result<()> {
        async {
            let mut tx = self.pool.begin().await?;
            for currency in batch {
                if !(currency.rate.is_finite() && currency.rate > 0.0) {
                    bail!("Refusing to store rate {} for {}", currency.rate, currency.code);
                }
                sqlx::query(
                    "INSERT INTO currency (id, code, rate) VALUES (?, ?, ?) \
                     ON CONFLICT (id) DO UPDATE SET code = excluded.code, rate = excluded.rate",
                )
                .bind(currency.id)
                .bind(&currency.code)
                .bind(currency.rate)
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await?;
            Ok::<(), anyhow::Error>(())
        }
        .await
        .context("Failed to upsert currency rates")
        .pub_result(ErrorType::Database)?;
        trace!("Upserted {} currency rates", batch.len());
        Ok(())
    }
}

#[async_trait::async_trait]
impl LedgerStore for Db {
    async fn add_user(&self, user_id: i64, month_limit: i64) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO users (id, default_month_limit, current_month_limit) VALUES (?, ?, ?) \
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(user_id)
        .bind(month_limit)
        .bind(month_limit)
        .execute(&self.pool)
        .await
        .context("Failed to insert user")
        .pub_result(ErrorType::Database)?;
        Ok(result.rows_affected() == 1)
    }

    async fn user(&self, user_id: i64) -> Result<User> {
        let row: Option<(i64, i64, i64, i64)> = sqlx::query_as(
            "SELECT id, base_currency_id, default_month_limit, current_month_limit \
             FROM users WHERE id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to query user")
        .pub_result(ErrorType::Database)?;
        let (id, currency_id, default_month_limit, current_month_limit) =
            row.ok_or(Error::UserNotFound(user_id))?;
        Ok(User {
            id,
            currency_id,
            default_month_limit,
            current_month_limit,
        })
    }

    async fn delete_user(&self, user_id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM users WHERE id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await
            .context("Failed to delete user")
            .pub_result(ErrorType::Database)?;
        if result.rows_affected() == 0 {
            return Err(Error::UserNotFound(user_id));
        }
        Ok(())
    }

    async fn set_currency(&self, user_id: i64, currency_id: i64) -> Result<()> {
        let result = sqlx::query("UPDATE users SET base_currency_id = ? WHERE id = ?")
            .bind(currency_id)
            .bind(user_id)
            .execute(&self.pool)
            .await;
        match result {
            Ok(r) if r.rows_affected() == 0 => Err(Error::UserNotFound(user_id)),
            Ok(_) => Ok(()),
            Err(e) if is_foreign_key_violation(&e) => {
                Err(Error::CurrencyNotFound(currency_id.to_string()))
            }
            Err(e) => Err(e)
                .context("Failed to update user currency")
                .pub_result(ErrorType::Database),
        }
    }

    async fn set_limit(&self, user_id: i64, limit: i64) -> Result<()> {
        let result = sqlx::query(
            "UPDATE users SET default_month_limit = ?, current_month_limit = ? WHERE id = ?",
        )
        .bind(limit)
        .bind(limit)
        .bind(user_id)
        .execute(&self.pool)
        .await
        .context("Failed to update user limit")
        .pub_result(ErrorType::Database)?;
        if result.rows_affected() == 0 {
            return Err(Error::UserNotFound(user_id));
        }
        Ok(())
    }

    async fn reset_limit(&self, user_id: i64) -> Result<()> {
        let result =
            sqlx::query("UPDATE users SET current_month_limit = default_month_limit WHERE id = ?")
                .bind(user_id)
                .execute(&self.pool)
                .await
                .context("Failed to reset user limit")
                .pub_result(ErrorType::Database)?;
        if result.rows_affected() == 0 {
            return Err(Error::UserNotFound(user_id));
        }
        Ok(())
    }

    async fn reset_all_limits(&self) -> Result<u64> {
        let result = sqlx::query("UPDATE users SET current_month_limit = default_month_limit")
            .execute(&self.pool)
            .await
            .context("Failed to reset limits")
            .pub_result(ErrorType::Database)?;
        Ok(result.rows_affected())
    }

    async fn category_id(&self, user_id: i64, name: &str) -> Result<Option<i64>> {
        sqlx::query_scalar("SELECT id FROM category WHERE user_id = ? AND name = ?")
            .bind(user_id)
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to query category")
            .pub_result(ErrorType::Database)
    }

    async fn add_category(&self, user_id: i64, name: &str) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO category (user_id, name) VALUES (?, ?) \
             ON CONFLICT (user_id, name) DO NOTHING",
        )
        .bind(user_id)
        .bind(name)
        .execute(&self.pool)
        .await;
        match result {
            Ok(r) => Ok(r.rows_affected() == 1),
            Err(e) if is_foreign_key_violation(&e) => Err(Error::UserNotFound(user_id)),
            Err(e) => Err(e)
                .context("Failed to insert category")
                .pub_result(ErrorType::Database),
        }
    }

    async fn insert_expense(&self, expense: &NewExpense, enforce_limit: bool) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin expense transaction")
            .pub_result(ErrorType::Database)?;

        if enforce_limit {
            let remaining: Option<i64> = sqlx::query_scalar(
                "UPDATE users SET current_month_limit = current_month_limit - ? \
                 WHERE id = ? RETURNING current_month_limit",
            )
            .bind(expense.amount)
            .bind(expense.user_id)
            .fetch_optional(&mut *tx)
            .await
            .context("Failed to decrement monthly limit")
            .pub_result(ErrorType::Database)?;

            match remaining {
                None => return Err(Error::UserNotFound(expense.user_id)),
                Some(remaining) if remaining < 0 => {
                    // release the write lock before returning
                    tx.rollback()
                        .await
                        .context("Failed to roll back expense transaction")
                        .pub_result(ErrorType::Database)?;
                    return Err(Error::LimitExceeded);
                }
                Some(remaining) => {
                    trace!(user_id = expense.user_id, remaining, "Monthly limit decremented")
                }
            }
        }

        let inserted = sqlx::query(
            "INSERT INTO expense (user_id, category_id, ts, amount) VALUES (?, ?, ?, ?)",
        )
        .bind(expense.user_id)
        .bind(expense.category_id)
        .bind(expense.timestamp.timestamp())
        .bind(expense.amount)
        .execute(&mut *tx)
        .await;
        if let Err(e) = inserted {
            return if is_foreign_key_violation(&e) {
                Err(Error::UserNotFound(expense.user_id))
            } else {
                Err(e)
                    .context("Failed to insert expense")
                    .pub_result(ErrorType::Database)
            };
        }

        tx.commit()
            .await
            .context("Failed to commit expense transaction")
            .pub_result(ErrorType::Database)
    }

    async fn expenses_since(&self, user_id: i64, since: DateTime<Utc>) -> Result<Vec<ExpenseRow>> {
        let rows: Vec<(i64, String, i64, i64)> = sqlx::query_as(
            "SELECT e.category_id, c.name, e.ts, e.amount \
             FROM expense e JOIN category c ON c.id = e.category_id \
             WHERE e.user_id = ? AND e.ts >= ? \
             ORDER BY e.ts, e.id",
        )
        .bind(user_id)
        .bind(since.timestamp())
        .fetch_all(&self.pool)
        .await
        .context("Failed to query expenses")
        .pub_result(ErrorType::Database)?;
        Ok(rows
            .into_iter()
            .map(|(category_id, category_name, ts, amount)| ExpenseRow {
                category_id,
                category_name,
                ts,
                amount,
            })
            .collect())
    }
}
