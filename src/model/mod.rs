//! Types that represent the core data model, such as `User`, `Currency` and `ExpenseRow`.
mod amount;
mod period;

pub use amount::{Amount, AmountError};
pub use period::{start_of_month, start_of_next_month, Period};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// A user of the ledger. Limits are integer minor units of the reference (storage) currency.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    /// The currency the user enters and reads amounts in.
    pub currency_id: i64,
    pub default_month_limit: i64,
    pub current_month_limit: i64,
}

/// A row of the currency table. `rate` is how many units of this currency buy one unit of the
/// reference currency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Currency {
    pub id: i64,
    pub code: String,
    pub rate: f64,
}

impl Currency {
    pub fn new(id: i64, code: impl Into<String>, rate: f64) -> Self {
        Self {
            id,
            code: code.into(),
            rate,
        }
    }
}

/// An expense about to be written. `amount` is already in reference-currency minor units.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct NewExpense {
    pub user_id: i64,
    pub category_id: i64,
    pub timestamp: DateTime<Utc>,
    pub amount: i64,
}

/// A stored expense joined with its category name, as read back for report computation.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct ExpenseRow {
    pub category_id: i64,
    pub category_name: String,
    /// Unix timestamp, seconds.
    pub ts: i64,
    /// Reference-currency minor units.
    pub amount: i64,
}

/// Category name → total in display-currency minor units. An empty report is a valid result.
pub type Report = BTreeMap<String, i64>;

/// "Compute totals for all of this user's expenses with timestamp ≥ `window_start`."
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct ReportRequest {
    pub correlation_id: Uuid,
    pub user_id: i64,
    pub window_start: DateTime<Utc>,
}

impl ReportRequest {
    /// Creates a request with a fresh correlation id.
    pub fn new(user_id: i64, window_start: DateTime<Utc>) -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            user_id,
            window_start,
        }
    }
}

/// The rows computed by a worker for one request, pushed back over the callback channel.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct ReportReply {
    pub correlation_id: Uuid,
    pub user_id: i64,
    pub expenses: Vec<ExpenseRow>,
}
