//! The report worker: consumes report requests, reads the ledger, and pushes the rows back.
//!
//! A message is acknowledged only after the callback attempt has completed, successfully or not.
//! If the worker dies before that, the queue redelivers the message and the report is computed
//! again, which is harmless. A failed ledger read leaves the message unacknowledged for the same
//! reason. Messages that can never be processed (malformed) are acknowledged and dropped.

use crate::ledger::Ledger;
use crate::model::ReportReply;
use crate::transport::{Delivery, ReportCallback, RequestConsumer};
use crate::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument, Span};

const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Outcome {
    /// The rows were handed to the callback channel (whether or not anyone still waited).
    Replied,
    /// The callback could not be reached; the message was acknowledged anyway.
    CallbackFailed,
    /// The message could not be parsed and was dropped.
    Dropped,
    /// The ledger could not be read; the message is left for redelivery.
    Deferred,
}

pub struct ReportWorker {
    ledger: Ledger,
    consumer: Arc<dyn RequestConsumer>,
    callback: Arc<dyn ReportCallback>,
    error_backoff: Duration,
    span: Span,
}

impl ReportWorker {
    pub fn new(
        ledger: Ledger,
        consumer: Arc<dyn RequestConsumer>,
        callback: Arc<dyn ReportCallback>,
        span: Span,
    ) -> Self {
        Self {
            ledger,
            consumer,
            callback,
            error_backoff: ERROR_BACKOFF,
            span,
        }
    }

    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    /// Processes messages until `cancel` fires. Returns the number of messages handled.
    pub async fn run(&self, cancel: CancellationToken) -> Result<u64> {
        async {
            info!("Report worker started");
            let mut handled = 0;
            loop {
                let delivery = match self.consumer.next(&cancel).await {
                    Ok(Some(delivery)) => delivery,
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Unable to read from the request queue: {e}");
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(self.error_backoff) => continue,
                        }
                    }
                };
                self.handle(&delivery).await;
                handled += 1;
            }
            info!(handled, "Report worker stopped");
            Ok(handled)
        }
        .instrument(self.span.clone())
        .await
    }

    /// Processes a single delivery.
    pub async fn handle(&self, delivery: &Delivery) -> Outcome {
        let outcome = self.process(delivery).await;
        if outcome != Outcome::Deferred {
            if let Err(e) = self.consumer.ack(delivery).await {
                // the message will come back after its lease and be computed again
                warn!(receipt = delivery.receipt, "Unable to acknowledge report request: {e}");
            }
        }
        outcome
    }

    async fn process(&self, delivery: &Delivery) -> Outcome {
        let request = match delivery.message.decode() {
            Ok(request) => request,
            Err(e) => {
                error!(receipt = delivery.receipt, "Dropping report request: {e}");
                return Outcome::Dropped;
            }
        };

        let expenses = match self
            .ledger
            .read_expenses(request.user_id, request.window_start)
            .await
        {
            Ok(expenses) => expenses,
            Err(e) => {
                warn!(
                    correlation_id = %request.correlation_id,
                    user_id = request.user_id,
                    "Unable to read expenses, leaving request for redelivery: {e}"
                );
                return Outcome::Deferred;
            }
        };

        let reply = ReportReply {
            correlation_id: request.correlation_id,
            user_id: request.user_id,
            expenses,
        };
        match self.callback.send_report(&reply).await {
            Ok(code) => {
                debug!(
                    correlation_id = %request.correlation_id,
                    user_id = request.user_id,
                    rows = reply.expenses.len(),
                    ?code,
                    "Report delivered"
                );
                Outcome::Replied
            }
            Err(e) => {
                warn!(
                    correlation_id = %request.correlation_id,
                    user_id = request.user_id,
                    "Report callback failed: {e}"
                );
                Outcome::CallbackFailed
            }
        }
    }
}
