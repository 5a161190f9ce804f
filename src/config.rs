//! Configuration file handling for spendbook.
//!
//! The configuration file is stored at `$SPENDBOOK_HOME/config.json` next to the SQLite database
//! `spendbook.sqlite`. The bot and the worker process load the same home directory; the database is
//! where they meet.

use crate::db::Db;
use crate::error::{ErrorType, IntoResult};
use crate::model::Currency;
use crate::store::CurrencyTable;
use crate::{utils, Result};
use anyhow::{bail, ensure, Context};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;
use url::Url;

const APP_NAME: &str = "spendbook";
const CONFIG_VERSION: u8 = 1;
const CONFIG_JSON: &str = "config.json";
const SPENDBOOK_SQLITE: &str = "spendbook.sqlite";

/// The `Config` object represents the configuration of the app. You instantiate it by providing the
/// path to `$SPENDBOOK_HOME` and from there it loads `$SPENDBOOK_HOME/config.json` and opens the
/// database.
#[derive(Debug, Clone)]
pub struct Config {
    root: PathBuf,
    config_path: PathBuf,
    config_file: ConfigFile,
    callback_addr: SocketAddr,
    rates_url: Url,
    db: Db,
    sqlite_path: PathBuf,
}

impl Config {
    /// Creates the home directory with a default `config.json`, creates the database and seeds the
    /// currency table with a rate of 1 for every configured currency.
    ///
    /// # Errors
    /// - Returns an error if the directory or the database cannot be created, or if a database
    ///   already exists there.
    pub async fn create(dir: impl Into<PathBuf>) -> Result<Self> {
        Self::create_with(dir, ConfigFile::default()).await
    }

    pub(crate) async fn create_with(dir: impl Into<PathBuf>, config_file: ConfigFile) -> Result<Self> {
        let maybe_relative = dir.into();
        utils::make_dir(&maybe_relative)
            .await
            .context("Unable to create the spendbook home directory")
            .pub_result(ErrorType::Config)?;
        let root = utils::canonicalize(&maybe_relative)
            .await
            .pub_result(ErrorType::Config)?;

        let (callback_addr, rates_url) = config_file.validate().pub_result(ErrorType::Config)?;
        let config_path = root.join(CONFIG_JSON);
        let sqlite_path = root.join(SPENDBOOK_SQLITE);
        if sqlite_path.exists() {
            return Err(anyhow::anyhow!(
                "'{}' is already initialized",
                root.display()
            ))
            .pub_result(ErrorType::Config);
        }
        config_file.save(&config_path).await?;

        let db = Db::init(&sqlite_path).await?;
        db.upsert_rates(&config_file.currency_seed()).await?;

        Ok(Self {
            root,
            config_path,
            config_file,
            callback_addr,
            rates_url,
            db,
            sqlite_path,
        })
    }

    /// This will
    /// - validate that `$SPENDBOOK_HOME` and the config file exist
    /// - load and validate the config file
    /// - open (and migrate) the database
    /// - add any configured currency that the currency table does not know yet, at rate 1
    pub async fn load(home: impl Into<PathBuf>) -> Result<Self> {
        let maybe_relative = home.into();
        let root = utils::canonicalize(&maybe_relative)
            .await
            .context("Spendbook home is missing")
            .pub_result(ErrorType::Config)?;

        let config_path = root.join(CONFIG_JSON);
        if !config_path.is_file() {
            return Err(anyhow::anyhow!(
                "The config file is missing '{}'",
                config_path.display()
            ))
            .pub_result(ErrorType::Config);
        }
        let config_file = ConfigFile::load(&config_path).await?;
        let (callback_addr, rates_url) = config_file.validate().pub_result(ErrorType::Config)?;

        let sqlite_path = root.join(SPENDBOOK_SQLITE);
        let db = Db::load(&sqlite_path).await?;

        let known: HashSet<i64> = db.currencies().await?.into_iter().map(|c| c.id).collect();
        let missing: Vec<Currency> = config_file
            .currency_seed()
            .into_iter()
            .filter(|c| !known.contains(&c.id))
            .collect();
        if !missing.is_empty() {
            debug!("Adding {} newly configured currencies", missing.len());
            db.upsert_rates(&missing).await?;
        }

        Ok(Self {
            root,
            config_path,
            config_file,
            callback_addr,
            rates_url,
            db,
            sqlite_path,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn sqlite_path(&self) -> &Path {
        &self.sqlite_path
    }

    pub(crate) fn db(&self) -> &Db {
        &self.db
    }

    pub fn reference_currency(&self) -> &str {
        &self.config_file.reference_currency
    }

    /// Supported currency codes. The position of a code is its currency id.
    pub fn currencies(&self) -> &[String] {
        &self.config_file.currencies
    }

    pub fn rates_url(&self) -> &Url {
        &self.rates_url
    }

    pub fn rates_refresh(&self) -> Duration {
        Duration::from_secs(self.config_file.rates_refresh_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.config_file.request_timeout_secs)
    }

    pub fn callback_addr(&self) -> SocketAddr {
        self.callback_addr
    }

    pub fn report_timeout(&self) -> Duration {
        Duration::from_secs(self.config_file.report_timeout_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.config_file.cache_ttl_secs)
    }

    pub fn default_month_limit(&self) -> i64 {
        self.config_file.default_month_limit
    }
}

/// Represents the serialization and deserialization format of the configuration file. Fields other
/// than `app_name` and `config_version` fall back to their defaults when absent.
///
/// Example configuration:
/// ```json
/// {
///   "app_name": "spendbook",
///   "config_version": 1,
///   "reference_currency": "RUB",
///   "currencies": ["RUB", "USD", "EUR", "CNY"],
///   "rates_url": "https://api.exchangerate.host/latest",
///   "rates_refresh_secs": 3600,
///   "request_timeout_secs": 10,
///   "callback_addr": "127.0.0.1:50051",
///   "report_timeout_secs": 30,
///   "cache_ttl_secs": 600,
///   "default_month_limit": 1000000
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub(crate) struct ConfigFile {
    /// Application name, should always be "spendbook"
    app_name: String,

    config_version: u8,

    /// The currency all ledger amounts are stored in. Must be the first entry of `currencies`.
    #[serde(default = "defaults::reference_currency")]
    reference_currency: String,

    /// Supported currency codes; the index of a code is its currency id
    #[serde(default = "defaults::currencies")]
    currencies: Vec<String>,

    #[serde(default = "defaults::rates_url")]
    rates_url: String,

    #[serde(default = "defaults::rates_refresh_secs")]
    rates_refresh_secs: u64,

    /// Bound on a single exchange rate fetch
    #[serde(default = "defaults::request_timeout_secs")]
    request_timeout_secs: u64,

    /// Where the bot process listens for report callbacks from workers
    #[serde(default = "defaults::callback_addr")]
    callback_addr: String,

    /// How long a report request waits for its worker before giving up
    #[serde(default = "defaults::report_timeout_secs")]
    report_timeout_secs: u64,

    #[serde(default = "defaults::cache_ttl_secs")]
    cache_ttl_secs: u64,

    /// Monthly limit of new users, in minor units of the reference currency
    #[serde(default = "defaults::default_month_limit")]
    default_month_limit: i64,
}

mod defaults {
    pub(super) fn reference_currency() -> String {
        "RUB".to_string()
    }

    pub(super) fn currencies() -> Vec<String> {
        ["RUB", "USD", "EUR", "CNY"]
            .into_iter()
            .map(String::from)
            .collect()
    }

    pub(super) fn rates_url() -> String {
        "https://api.exchangerate.host/latest".to_string()
    }

    pub(super) fn rates_refresh_secs() -> u64 {
        3600
    }

    pub(super) fn request_timeout_secs() -> u64 {
        10
    }

    pub(super) fn callback_addr() -> String {
        "127.0.0.1:50051".to_string()
    }

    pub(super) fn report_timeout_secs() -> u64 {
        30
    }

    pub(super) fn cache_ttl_secs() -> u64 {
        600
    }

    pub(super) fn default_month_limit() -> i64 {
        1_000_000
    }
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            app_name: APP_NAME.to_string(),
            config_version: CONFIG_VERSION,
            reference_currency: defaults::reference_currency(),
            currencies: defaults::currencies(),
            rates_url: defaults::rates_url(),
            rates_refresh_secs: defaults::rates_refresh_secs(),
            request_timeout_secs: defaults::request_timeout_secs(),
            callback_addr: defaults::callback_addr(),
            report_timeout_secs: defaults::report_timeout_secs(),
            cache_ttl_secs: defaults::cache_ttl_secs(),
            default_month_limit: defaults::default_month_limit(),
        }
    }
}

impl ConfigFile {
    /// Loads a ConfigFile asynchronously from the specified path.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed, or names another app
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = utils::read(path).await.pub_result(ErrorType::Config)?;

        let config: ConfigFile = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file at {}", path.display()))
            .pub_result(ErrorType::Config)?;

        if config.app_name != APP_NAME {
            return Err(anyhow::anyhow!(
                "Invalid app_name in config file: expected '{}', got '{}'",
                APP_NAME,
                config.app_name
            ))
            .pub_result(ErrorType::Config);
        }

        Ok(config)
    }

    /// Saves the ConfigFile to the specified path.
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let data = serde_json::to_string_pretty(self)
            .context("Unable to serialize config")
            .pub_result(ErrorType::Config)?;
        utils::write(path, data)
            .await
            .context("Unable to write config file")
            .pub_result(ErrorType::Config)
    }

    /// Checks the settings that cannot be checked by deserialization alone and returns the parsed
    /// callback address and rates URL.
    fn validate(&self) -> anyhow::Result<(SocketAddr, Url)> {
        ensure!(!self.currencies.is_empty(), "At least one currency must be configured");
        let mut seen = HashSet::new();
        for code in &self.currencies {
            if !seen.insert(code.as_str()) {
                bail!("Currency '{code}' is configured twice");
            }
        }
        if self.currencies[0] != self.reference_currency {
            bail!(
                "The reference currency '{}' must be the first configured currency, found '{}'",
                self.reference_currency,
                self.currencies[0]
            );
        }
        ensure!(self.cache_ttl_secs > 0, "cache_ttl_secs must be greater than zero");
        ensure!(
            self.rates_refresh_secs > 0,
            "rates_refresh_secs must be greater than zero"
        );
        ensure!(
            self.request_timeout_secs > 0,
            "request_timeout_secs must be greater than zero"
        );
        ensure!(
            self.report_timeout_secs > 0,
            "report_timeout_secs must be greater than zero"
        );
        ensure!(
            self.default_month_limit > 0,
            "default_month_limit must be greater than zero"
        );
        let callback_addr: SocketAddr = self
            .callback_addr
            .parse()
            .with_context(|| format!("Invalid callback_addr '{}'", self.callback_addr))?;
        let rates_url = Url::parse(&self.rates_url)
            .with_context(|| format!("Invalid rates_url '{}'", self.rates_url))?;
        Ok((callback_addr, rates_url))
    }

    /// One currency per configured code, id = position, at rate 1.
    fn currency_seed(&self) -> Vec<Currency> {
        self.currencies
            .iter()
            .enumerate()
            .map(|(id, code)| Currency::new(id as i64, code.clone(), 1.0))
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn with_callback_addr(mut self, addr: &str) -> Self {
        self.callback_addr = addr.to_string();
        self
    }

    #[cfg(test)]
    pub(crate) fn with_rates_url(mut self, url: &str) -> Self {
        self.rates_url = url.to_string();
        self
    }

    #[cfg(test)]
    pub(crate) fn with_default_month_limit(mut self, limit: i64) -> Self {
        self.default_month_limit = limit;
        self
    }
}
