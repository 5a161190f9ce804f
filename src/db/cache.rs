//! The report cache stored in the shared SQLite file.

use crate::cache::{cache_key, user_prefix, ReportCache};
use crate::db::Db;
use crate::error::{ErrorType, IntoResult};
use crate::model::Report;
use crate::Result;
use anyhow::Context;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// A [`ReportCache`] over the `report_cache` table. Expiry times are unix milliseconds.
#[derive(Debug, Clone)]
pub struct SqliteReportCache {
    db: Db,
}

impl SqliteReportCache {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// The smallest string greater than every key starting with `prefix`, given that the prefix ends
/// with ':'.
fn prefix_end(prefix: &str) -> String {
    let mut end = prefix.trim_end_matches(':').to_string();
    end.push(';');
    end
}

#[async_trait::async_trait]
impl ReportCache for SqliteReportCache {
    async fn get(&self, user_id: i64, window_start: DateTime<Utc>) -> Result<Option<Report>> {
        let body: Option<String> = sqlx::query_scalar(
            "SELECT body FROM report_cache WHERE cache_key = ? AND expires_at > ?",
        )
        .bind(cache_key(user_id, window_start))
        .bind(now_millis())
        .fetch_optional(self.db.pool())
        .await
        .context("Failed to read report cache")
        .pub_result(ErrorType::Database)?;

        body.map(|b| serde_json::from_str::<Report>(&b))
            .transpose()
            .context("Cached report is not valid JSON")
            .pub_result(ErrorType::Internal)
    }

    async fn set(
        &self,
        user_id: i64,
        window_start: DateTime<Utc>,
        report: &Report,
        ttl: Duration,
    ) -> Result<()> {
        let body = serde_json::to_string(report)
            .context("Unable to serialize report")
            .pub_result(ErrorType::Internal)?;
        let ttl = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let now = now_millis();

        async {
            let mut tx = self.db.pool().begin().await?;
            sqlx::query("DELETE FROM report_cache WHERE expires_at <= ?")
                .bind(now)
                .execute(&mut *tx)
                .await?;
            sqlx::query(
                "INSERT INTO report_cache (cache_key, window_start, body, expires_at) \
                 VALUES (?, ?, ?, ?) \
                 ON CONFLICT (cache_key) DO UPDATE SET body = excluded.body, \
                 expires_at = excluded.expires_at",
            )
            .bind(cache_key(user_id, window_start))
            .bind(window_start.timestamp())
            .bind(body)
            .bind(now.saturating_add(ttl))
            .execute(&mut *tx)
            .await?;
            tx.commit().await
        }
        .await
        .context("Failed to write report cache")
        .pub_result(ErrorType::Database)
    }

    async fn invalidate_all(&self, user_id: i64) -> Result<usize> {
        let prefix = user_prefix(user_id);
        let result =
            sqlx::query("DELETE FROM report_cache WHERE cache_key >= ? AND cache_key < ?")
                .bind(&prefix)
                .bind(prefix_end(&prefix))
                .execute(self.db.pool())
                .await
                .context("Failed to invalidate report cache")
                .pub_result(ErrorType::Database)?;
        Ok(result.rows_affected() as usize)
    }
}
