//! The report orchestrator: cache-aside report computation through the worker round trip.
//!
//! `get_report` either answers from the cache or runs
//! `publish → await callback → aggregate → populate cache`. Every request carries a fresh
//! correlation id; a table of pending waiters keyed by that id routes each callback to the request
//! that asked for it, so concurrent requests never receive each other's rows.
//!
//! A waiter is registered before its request is published and removed when the request finishes
//! for any reason (result, cancellation, timeout, or publish failure). A callback that finds no
//! waiter is acknowledged with [`AckCode::NoWaiter`] and dropped.

use crate::cache::ReportCache;
use crate::conversion::{from_base, ConversionService, Rate};
use crate::model::{ExpenseRow, Report, ReportReply, ReportRequest};
use crate::store::LedgerStore;
use crate::transport::{AckCode, ReportCallback, RequestPublisher};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn, Instrument, Span};
use uuid::Uuid;

const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(600);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

struct Waiter {
    user_id: i64,
    tx: oneshot::Sender<Vec<ExpenseRow>>,
}

type PendingMap = Arc<Mutex<HashMap<Uuid, Waiter>>>;

fn lock(pending: &PendingMap) -> MutexGuard<'_, HashMap<Uuid, Waiter>> {
    // the map holds no invariants a panicking holder could break
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Removes a waiter from the pending table when the request that registered it goes away.
struct PendingGuard {
    pending: PendingMap,
    correlation_id: Uuid,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        lock(&self.pending).remove(&self.correlation_id);
    }
}

#[derive(Clone)]
pub struct ReportOrchestrator {
    store: Arc<dyn LedgerStore>,
    conversion: ConversionService,
    cache: Arc<dyn ReportCache>,
    publisher: Arc<dyn RequestPublisher>,
    pending: PendingMap,
    cache_ttl: Duration,
    timeout: Duration,
    span: Span,
}

impl ReportOrchestrator {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        conversion: ConversionService,
        cache: Arc<dyn ReportCache>,
        publisher: Arc<dyn RequestPublisher>,
        span: Span,
    ) -> Self {
        Self {
            store,
            conversion,
            cache,
            publisher,
            pending: Arc::new(Mutex::new(HashMap::new())),
            cache_ttl: DEFAULT_CACHE_TTL,
            timeout: DEFAULT_TIMEOUT,
            span,
        }
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Upper bound on waiting for a worker, on top of the caller's own cancellation.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Number of requests currently waiting for a callback.
    pub fn pending(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Category name → total spent since `window_start`, in the user's display currency.
    ///
    /// # Errors
    /// - `Cancelled` if `cancel` fires or the timeout elapses before the worker answers. The cache
    ///   is left untouched so that a retry publishes again.
    /// - `TransportUnavailable` if the request could not be published.
    /// - `UserNotFound`, `CurrencyNotFound`, `ConversionFailure` from the rate lookup, in which case
    ///   nothing is published.
    pub async fn get_report(
        &self,
        user_id: i64,
        window_start: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Report> {
        self.get_report_inner(user_id, window_start, cancel)
            .instrument(self.span.clone())
            .await
    }

    async fn get_report_inner(
        &self,
        user_id: i64,
        window_start: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Report> {
        match self.cache.get(user_id, window_start).await {
            Ok(Some(report)) => {
                trace!(user_id, "Report cache hit");
                return Ok(report);
            }
            Ok(None) => trace!(user_id, "Report cache miss"),
            Err(e) => warn!(user_id, "Report cache lookup failed, computing: {e}"),
        }

        let user = self.store.user(user_id).await?;
        let rate = self.conversion.rate(user.currency_id).await?;

        let request = ReportRequest::new(user_id, window_start);
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(request.correlation_id, Waiter { user_id, tx });
        let _guard = PendingGuard {
            pending: self.pending.clone(),
            correlation_id: request.correlation_id,
        };

        self.publisher.publish(&request).await?;
        debug!(user_id, correlation_id = %request.correlation_id, "Awaiting report from worker");

        let rows = tokio::select! {
            rows = rx => rows.map_err(|_| {
                Error::Internal(anyhow::anyhow!("report waiter was dropped without an answer"))
            })?,
            _ = cancel.cancelled() => {
                debug!(user_id, correlation_id = %request.correlation_id, "Report request cancelled");
                return Err(Error::Cancelled);
            }
            _ = tokio::time::sleep(self.timeout) => {
                warn!(
                    user_id,
                    correlation_id = %request.correlation_id,
                    "No report after {:?}, giving up",
                    self.timeout
                );
                return Err(Error::Cancelled);
            }
        };

        let report = aggregate(&rows, rate)?;
        if let Err(e) = self
            .cache
            .set(user_id, window_start, &report, self.cache_ttl)
            .await
        {
            warn!(user_id, "Unable to cache report: {e}");
        }
        Ok(report)
    }

    /// Hands a worker's rows to the request waiting for them.
    pub fn deliver(&self, reply: ReportReply) -> AckCode {
        let _entered = self.span.enter();
        let mut pending = lock(&self.pending);
        let Some(waiter) = pending.get(&reply.correlation_id) else {
            debug!(correlation_id = %reply.correlation_id, "Report arrived with no waiter");
            return AckCode::NoWaiter;
        };
        if waiter.user_id != reply.user_id {
            warn!(
                correlation_id = %reply.correlation_id,
                expected = waiter.user_id,
                got = reply.user_id,
                "Report is for another user, dropping it"
            );
            return AckCode::NoWaiter;
        }
        let Some(waiter) = pending.remove(&reply.correlation_id) else {
            return AckCode::NoWaiter;
        };
        drop(pending);

        match waiter.tx.send(reply.expenses) {
            Ok(()) => AckCode::Delivered,
            // the requester is gone but has not removed itself yet
            Err(_) => AckCode::NoWaiter,
        }
    }
}

/// In-process dispatch of callbacks; also the sink behind the HTTP callback server.
#[async_trait::async_trait]
impl ReportCallback for ReportOrchestrator {
    async fn send_report(&self, reply: &ReportReply) -> Result<AckCode> {
        Ok(self.deliver(reply.clone()))
    }
}

/// Sums rows per category name and converts each total to the display currency.
fn aggregate(rows: &[ExpenseRow], rate: Rate) -> Result<Report> {
    let mut totals: HashMap<&str, i64> = HashMap::new();
    for row in rows {
        let total = totals.entry(row.category_name.as_str()).or_insert(0);
        *total = total.checked_add(row.amount).ok_or_else(|| {
            Error::ConversionFailure(format!("total of '{}' overflows", row.category_name))
        })?;
    }
    totals
        .into_iter()
        .map(|(name, total)| Ok((name.to_string(), from_base(total, rate)?)))
        .collect()
}
