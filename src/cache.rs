//! Report cache: (user, window-start) → category totals, TTL-bounded and invalidated per user.
//!
//! Keys are `"{user_id}:{window_start_unix}"`. Every key of a user shares the `"{user_id}:"` prefix,
//! which is what [`ReportCache::invalidate_all`] scans for. The separator keeps user `1` from matching
//! the keys of user `12`.

use crate::model::Report;
use crate::Result;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// Stores reports that are already converted to the user's display currency.
#[async_trait::async_trait]
pub trait ReportCache: Send + Sync {
    /// Returns the cached report, or `None` on a miss or an expired entry.
    async fn get(&self, user_id: i64, window_start: DateTime<Utc>) -> Result<Option<Report>>;

    async fn set(
        &self,
        user_id: i64,
        window_start: DateTime<Utc>,
        report: &Report,
        ttl: Duration,
    ) -> Result<()>;

    /// Deletes every entry of the user regardless of window-start. Returns how many were removed.
    async fn invalidate_all(&self, user_id: i64) -> Result<usize>;
}

pub fn cache_key(user_id: i64, window_start: DateTime<Utc>) -> String {
    format!("{}{}", user_prefix(user_id), window_start.timestamp())
}

pub fn user_prefix(user_id: i64) -> String {
    format!("{user_id}:")
}

struct Entry {
    report: Report,
    expires_at: Instant,
}

/// A process-local cache. Suitable when the bot runs as a single process.
#[derive(Default)]
pub struct MemoryReportCache {
    entries: RwLock<BTreeMap<String, Entry>>,
}

impl MemoryReportCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl ReportCache for MemoryReportCache {
    async fn get(&self, user_id: i64, window_start: DateTime<Utc>) -> Result<Option<Report>> {
        let key = cache_key(user_id, window_start);
        {
            let entries = self.entries.read().await;
            match entries.get(&key) {
                None => return Ok(None),
                Some(entry) if entry.expires_at > Instant::now() => {
                    return Ok(Some(entry.report.clone()))
                }
                Some(_) => {}
            }
        }
        // expired, drop it while we are here
        let mut entries = self.entries.write().await;
        if entries
            .get(&key)
            .is_some_and(|e| e.expires_at <= Instant::now())
        {
            entries.remove(&key);
        }
        Ok(None)
    }

    async fn set(
        &self,
        user_id: i64,
        window_start: DateTime<Utc>,
        report: &Report,
        ttl: Duration,
    ) -> Result<()> {
        let entry = Entry {
            report: report.clone(),
            expires_at: Instant::now() + ttl,
        };
        self.entries
            .write()
            .await
            .insert(cache_key(user_id, window_start), entry);
        Ok(())
    }

    async fn invalidate_all(&self, user_id: i64) -> Result<usize> {
        let prefix = user_prefix(user_id);
        let mut entries = self.entries.write().await;
        let keys: Vec<String> = entries
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &keys {
            entries.remove(key);
        }
        Ok(keys.len())
    }
}
