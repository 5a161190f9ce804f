//! spendbook: a personal expense ledger with monthly limits, currency conversion and spending
//! reports computed by a separate worker process.

pub mod args;
pub mod cache;
pub mod commands;
mod config;
pub mod conversion;
pub mod db;
mod error;
pub mod ledger;
pub mod model;
pub mod orchestrator;
pub mod rates;
pub mod store;
pub mod transport;
mod utils;
pub mod worker;

#[cfg(test)]
mod test;

pub use config::Config;
pub use error::Error;
pub use error::Result;
