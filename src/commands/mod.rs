//! Command handlers for the spendbook CLI.
//!
//! This module contains implementations for all CLI subcommands.

mod category;
mod currency;
mod expense;
mod init;
mod limit;
mod report;
mod user;
mod worker;

use crate::cache::ReportCache;
use crate::db::SqliteReportCache;
use crate::ledger::Ledger;
use crate::Config;
use serde::Serialize;
use std::fmt::Debug;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn};

pub use category::category_add;
pub use currency::{currency_list, currency_refresh, currency_set};
pub use expense::expense_add;
pub use init::init;
pub use limit::{limit_reset, limit_reset_all, limit_set, limit_show};
pub use report::{report, ReportOutput};
pub use user::{user_add, user_reset};
pub use worker::worker;

/// The output type for a command. This allows the command to return a consistent message and,
/// optionally, structured data to the command line.
#[derive(Debug, Clone, Serialize)]
pub struct Out<T>
where
    T: Serialize + Clone + Debug,
{
    /// A message that can be printed to the user regarding the outcome of the command execution.
    message: String,

    /// Any structured data that needs to be output from the call.
    structure: Option<T>,
}

impl<T, S> From<S> for Out<T>
where
    T: Debug + Clone + Serialize,
    S: Into<String>,
{
    fn from(value: S) -> Self {
        Out::new_message(value)
    }
}

impl<T> Out<T>
where
    T: Serialize + Clone + Debug,
{
    /// Create a new `Out` object that has `Some(structure)`.
    pub fn new<S>(message: S, structure: T) -> Self
    where
        S: Into<String>,
    {
        Self {
            message: message.into(),
            structure: Some(structure),
        }
    }

    /// Create a new `Out` object that has `None` for `structure`.
    pub fn new_message<S>(message: S) -> Self
    where
        S: Into<String>,
    {
        Self {
            message: message.into(),
            structure: None,
        }
    }

    /// Get the `message`.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Get the structured data stored in `structure`.
    pub fn structure(&self) -> Option<&T> {
        self.structure.as_ref()
    }

    /// Print the message to `info!` and the structured data (if it exists) as JSON to `debug!`.
    pub fn print(&self) {
        info!("{}", self.message);
        if let Some(structure) = self.structure() {
            if let Ok(json) = serde_json::to_string_pretty(structure) {
                debug!("Command output:\n\n{json}\n\n");
            }
        }
    }
}

/// The report cache shared by every process that opens this home directory.
fn report_cache(config: &Config) -> Arc<dyn ReportCache> {
    Arc::new(SqliteReportCache::new(config.db().clone()))
}

fn ledger(config: &Config) -> Ledger {
    let db = Arc::new(config.db().clone());
    Ledger::new(
        db.clone(),
        db,
        report_cache(config),
        info_span!("ledger"),
    )
    .with_default_month_limit(config.default_month_limit())
}

/// A token that fires on Ctrl-C.
fn interrupt() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupted, shutting down");
                token.cancel();
            }
            Err(e) => warn!("Unable to listen for Ctrl-C: {e}"),
        }
    });
    cancel
}
