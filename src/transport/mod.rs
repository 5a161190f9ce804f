//! The two halves of the report round trip between the bot process and the worker process.
//!
//! - The request side ([`RequestPublisher`], [`RequestConsumer`]) is an ordered, at-least-once queue
//!   keyed by user id. See [`queue`].
//! - The callback side ([`ReportCallback`]) is a point-to-point call from the worker back into the
//!   bot process carrying the computed rows. See [`callback`].
//!
//! Both halves retry transient failures with bounded exponential backoff ([`RetryConfig`]) and then
//! give up with `TransportUnavailable`.

pub mod callback;
pub mod queue;

use crate::model::{ReportReply, ReportRequest};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// A report request as it travels on the queue. The key is the user id and the value is the
/// window-start as unix seconds, both decimal strings. The correlation id travels as a header.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct WireMessage {
    pub correlation_id: String,
    pub key: String,
    pub value: String,
}

impl WireMessage {
    pub fn encode(request: &ReportRequest) -> Self {
        Self {
            correlation_id: request.correlation_id.to_string(),
            key: request.user_id.to_string(),
            value: request.window_start.timestamp().to_string(),
        }
    }

    /// Parses the message back into a request. Any malformed part is an `Internal` error; such a
    /// message can never be processed and should be acknowledged and dropped.
    pub fn decode(&self) -> Result<ReportRequest> {
        let correlation_id = Uuid::parse_str(&self.correlation_id)
            .map_err(|e| malformed("correlation id", &self.correlation_id, e))?;
        let user_id: i64 = self
            .key
            .parse()
            .map_err(|e| malformed("key", &self.key, e))?;
        let seconds: i64 = self
            .value
            .parse()
            .map_err(|e| malformed("value", &self.value, e))?;
        let window_start = DateTime::<Utc>::from_timestamp(seconds, 0).ok_or_else(|| {
            Error::Internal(anyhow::anyhow!("window-start {seconds} is out of range"))
        })?;
        Ok(ReportRequest {
            correlation_id,
            user_id,
            window_start,
        })
    }
}

fn malformed(what: &str, raw: &str, e: impl std::fmt::Display) -> Error {
    Error::Internal(anyhow::anyhow!("malformed message {what} '{raw}': {e}"))
}

/// A message handed to a consumer. It must be acknowledged with [`RequestConsumer::ack`] once it
/// has been dealt with, otherwise it is redelivered.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Delivery {
    /// Opaque handle identifying this delivery to the queue.
    pub receipt: i64,
    pub message: WireMessage,
    /// How many times this message has been handed out, this delivery included.
    pub attempt: i64,
}

/// Producer side of the report request queue.
#[async_trait::async_trait]
pub trait RequestPublisher: Send + Sync {
    /// Hands the request to the queue. Returns once the queue has durably accepted it.
    async fn publish(&self, request: &ReportRequest) -> Result<()>;
}

/// Consumer side of the report request queue.
#[async_trait::async_trait]
pub trait RequestConsumer: Send + Sync {
    /// Waits for the next message. Returns `None` once `cancel` fires.
    async fn next(&self, cancel: &CancellationToken) -> Result<Option<Delivery>>;

    /// Removes the delivered message from the queue for good.
    async fn ack(&self, delivery: &Delivery) -> Result<()>;
}

/// How the bot process acknowledged a callback.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
pub enum AckCode {
    /// The rows were handed to a waiting report request.
    Delivered,
    /// The rows were accepted but nobody was waiting for them anymore.
    NoWaiter,
}

impl From<AckCode> for i32 {
    fn from(code: AckCode) -> Self {
        match code {
            AckCode::Delivered => 1,
            AckCode::NoWaiter => 2,
        }
    }
}

impl TryFrom<i32> for AckCode {
    type Error = String;

    fn try_from(code: i32) -> std::result::Result<Self, Self::Error> {
        match code {
            1 => Ok(AckCode::Delivered),
            2 => Ok(AckCode::NoWaiter),
            other => Err(format!("unknown response code {other}")),
        }
    }
}

/// The return path from the worker into the bot process.
#[async_trait::async_trait]
pub trait ReportCallback: Send + Sync {
    async fn send_report(&self, reply: &ReportReply) -> Result<AckCode>;
}

/// Bounded exponential backoff for transport calls.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (0-indexed): `min(base_delay * 2^attempt, max_delay)`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Runs `op` until it succeeds, fails with a non-transient error, or the retry budget is spent.
/// The last transient failure is surfaced as `TransportUnavailable`.
pub async fn with_retry<T, F, Fut>(config: &RetryConfig, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(attempt, "{what} succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if !matches!(e, Error::TransportUnavailable(_)) => return Err(e),
            Err(e) if attempt >= config.max_retries => {
                return Err(Error::TransportUnavailable(format!(
                    "{what} failed after {} attempts: {e}",
                    attempt + 1
                )));
            }
            Err(e) => {
                let delay = config.delay(attempt);
                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "{what} failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryConfig {
        RetryConfig {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_wire_contract() {
        let request = ReportRequest::new(42, Utc.with_ymd_and_hms(2025, 10, 1, 0, 0, 0).unwrap());
        let wire = WireMessage::encode(&request);
        assert_eq!(wire.key, "42");
        assert_eq!(wire.value, "1759276800");
        assert_eq!(wire.decode().unwrap(), request);
    }

    #[test]
    fn test_malformed_messages() {
        let good = WireMessage::encode(&ReportRequest::new(1, DateTime::UNIX_EPOCH));
        let bad_key = WireMessage {
            key: "one".to_string(),
            ..good.clone()
        };
        let bad_value = WireMessage {
            value: "yesterday".to_string(),
            ..good.clone()
        };
        let bad_id = WireMessage {
            correlation_id: "42".to_string(),
            ..good
        };
        for msg in [bad_key, bad_value, bad_id] {
            assert!(matches!(msg.decode(), Err(Error::Internal(_))));
        }
    }

    #[test]
    fn test_ack_code_wire_values() {
        assert_eq!(serde_json::to_string(&AckCode::Delivered).unwrap(), "1");
        assert_eq!(serde_json::to_string(&AckCode::NoWaiter).unwrap(), "2");
        assert_eq!(serde_json::from_str::<AckCode>("2").unwrap(), AckCode::NoWaiter);
        assert!(serde_json::from_str::<AckCode>("7").is_err());
    }

    #[test]
    fn test_delay_is_exponential_and_capped() {
        let config = RetryConfig {
            max_retries: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
        };
        assert_eq!(config.delay(0), Duration::from_millis(100));
        assert_eq!(config.delay(1), Duration::from_millis(200));
        assert_eq!(config.delay(3), Duration::from_millis(800));
        assert_eq!(config.delay(4), Duration::from_millis(1000));
        assert_eq!(config.delay(40), Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_failures() {
        let calls = AtomicU32::new(0);
        let out = with_retry(&fast(), "publish", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::TransportUnavailable("down".to_string()))
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();
        assert_eq!(out, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_budget_is_bounded() {
        let calls = AtomicU32::new(0);
        let err = with_retry(&fast(), "publish", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(Error::TransportUnavailable("down".to_string()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::TransportUnavailable(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_domain_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let err = with_retry(&fast(), "publish", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(Error::UserNotFound(1))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::UserNotFound(1)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
