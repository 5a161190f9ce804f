//! These structs provide the CLI interface for the spendbook CLI.

use crate::model::{Amount, Period};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use std::convert::Infallible;
use std::fmt::{Display, Formatter};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::error;
use tracing_subscriber::filter::LevelFilter;

/// spendbook: A command-line expense ledger.
///
/// Record expenses per category in the currency of your choice, keep an eye on a monthly
/// spending limit, and get spending reports per category for the last day, week, month or year.
///
/// Reports are computed by a worker process (`spendbook worker`) that reads the ledger and sends
/// the rows back to the `report` command. Use `spendbook report --local` to compute a report
/// without a separate worker.
#[derive(Debug, Parser, Clone)]
pub struct Args {
    #[clap(flatten)]
    common: Common,

    #[command(subcommand)]
    command: Command,
}

impl Args {
    pub fn new(common: Common, command: Command) -> Self {
        Self { common, command }
    }

    pub fn common(&self) -> &Common {
        &self.common
    }

    pub fn command(&self) -> &Command {
        &self.command
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Create the data directory, the configuration file and the database.
    ///
    /// This is the first command you should run. By default the data directory is
    /// $HOME/spendbook; pass --home (or set SPENDBOOK_HOME) to put it somewhere else.
    Init(InitArgs),
    /// Register or erase users.
    User(UserArgs),
    /// Manage a user's expense categories.
    Category(CategoryArgs),
    /// Record expenses.
    Expense(ExpenseArgs),
    /// Show and change monthly spending limits.
    Limit(LimitArgs),
    /// List currencies, refresh exchange rates, or change a user's currency.
    Currency(CurrencyArgs),
    /// Print a spending report per category.
    Report(ReportArgs),
    /// Run the report worker until interrupted.
    Worker(WorkerArgs),
}

/// Arguments common to all subcommands.
#[derive(Debug, Parser, Clone)]
pub struct Common {
    /// The logging verbosity. One of, from least to most verbose:
    /// off, error, warn, info, debug, trace
    ///
    /// This can be overridden by RUST_LOG. See the tracing-subscriber crate for instructions.
    #[arg(long, default_value_t = LevelFilter::INFO)]
    log_level: LevelFilter,

    /// The directory where spendbook data and configuration is held. Defaults to ~/spendbook
    #[arg(long, env = "SPENDBOOK_HOME", default_value_t = default_spendbook_home())]
    home: DisplayPath,
}

impl Common {
    pub fn new(log_level: LevelFilter, home: PathBuf) -> Self {
        Self {
            log_level,
            home: home.into(),
        }
    }

    pub fn log_level(&self) -> LevelFilter {
        self.log_level
    }

    pub fn home(&self) -> &DisplayPath {
        &self.home
    }
}

/// (Not shown): Args for the `spendbook init` command.
#[derive(Debug, Parser, Clone)]
pub struct InitArgs {
    /// Overwrite nothing, but succeed if the directory is already initialized.
    #[arg(long)]
    exist_ok: bool,
}

impl InitArgs {
    pub fn new(exist_ok: bool) -> Self {
        Self { exist_ok }
    }

    pub fn exist_ok(&self) -> bool {
        self.exist_ok
    }
}

/// A user id, as used by every command that acts on behalf of one user.
#[derive(Debug, Parser, Clone)]
pub struct UserId {
    /// The id of the user.
    #[arg(long)]
    user: i64,
}

impl UserId {
    pub fn new(user: i64) -> Self {
        Self { user }
    }

    pub fn user(&self) -> i64 {
        self.user
    }
}

/// (Not shown): Args for the `spendbook user` command.
#[derive(Debug, Parser, Clone)]
pub struct UserArgs {
    #[command(subcommand)]
    action: UserSubcommand,
}

impl UserArgs {
    pub fn new(action: UserSubcommand) -> Self {
        Self { action }
    }

    pub fn action(&self) -> &UserSubcommand {
        &self.action
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum UserSubcommand {
    /// Register a user. Does nothing if the user already exists.
    Add(UserId),
    /// Erase a user together with all of their categories and expenses.
    Reset(UserId),
}

/// (Not shown): Args for the `spendbook category` command.
#[derive(Debug, Parser, Clone)]
pub struct CategoryArgs {
    #[command(subcommand)]
    action: CategorySubcommand,
}

impl CategoryArgs {
    pub fn new(action: CategorySubcommand) -> Self {
        Self { action }
    }

    pub fn action(&self) -> &CategorySubcommand {
        &self.action
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum CategorySubcommand {
    /// Add a category. Does nothing if the user already has it.
    Add(CategoryAddArgs),
}

/// (Not shown): Args for the `spendbook category add` command.
#[derive(Debug, Parser, Clone)]
pub struct CategoryAddArgs {
    #[clap(flatten)]
    user: UserId,

    /// The name of the category, e.g. "groceries".
    name: String,
}

impl CategoryAddArgs {
    pub fn new(user: i64, name: impl Into<String>) -> Self {
        Self {
            user: UserId::new(user),
            name: name.into(),
        }
    }

    pub fn user(&self) -> i64 {
        self.user.user()
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// (Not shown): Args for the `spendbook expense` command.
#[derive(Debug, Parser, Clone)]
pub struct ExpenseArgs {
    #[command(subcommand)]
    action: ExpenseSubcommand,
}

impl ExpenseArgs {
    pub fn new(action: ExpenseSubcommand) -> Self {
        Self { action }
    }

    pub fn action(&self) -> &ExpenseSubcommand {
        &self.action
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum ExpenseSubcommand {
    /// Record an expense in the user's currency.
    Add(ExpenseAddArgs),
}

/// (Not shown): Args for the `spendbook expense add` command.
#[derive(Debug, Parser, Clone)]
pub struct ExpenseAddArgs {
    #[clap(flatten)]
    user: UserId,

    /// The category the expense belongs to. It must already exist.
    category: String,

    /// The amount in the user's currency, e.g. 12.50
    amount: Amount,

    /// The date of the expense as YYYY-MM-DD or an RFC 3339 timestamp. Defaults to now.
    /// Only expenses dated in the current month count against the monthly limit.
    #[arg(long)]
    date: Option<Timestamp>,
}

impl ExpenseAddArgs {
    pub fn new(
        user: i64,
        category: impl Into<String>,
        amount: Amount,
        date: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            user: UserId::new(user),
            category: category.into(),
            amount,
            date: date.map(Timestamp),
        }
    }

    pub fn user(&self) -> i64 {
        self.user.user()
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn amount(&self) -> Amount {
        self.amount
    }

    pub fn date(&self) -> Option<DateTime<Utc>> {
        self.date.as_ref().map(|t| t.0)
    }
}

/// (Not shown): Args for the `spendbook limit` command.
#[derive(Debug, Parser, Clone)]
pub struct LimitArgs {
    #[command(subcommand)]
    action: LimitSubcommand,
}

impl LimitArgs {
    pub fn new(action: LimitSubcommand) -> Self {
        Self { action }
    }

    pub fn action(&self) -> &LimitSubcommand {
        &self.action
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum LimitSubcommand {
    /// Show the user's monthly limit and what is left of it this month.
    Show(UserId),
    /// Set the user's monthly limit, in their currency. This also resets what is left this month.
    Set(LimitSetArgs),
    /// Restore what is left of the user's limit this month to the full monthly limit.
    Reset(UserId),
    /// Restore the current limit of every user. This is what the monthly job does.
    ResetAll,
}

/// (Not shown): Args for the `spendbook limit set` command.
#[derive(Debug, Parser, Clone)]
pub struct LimitSetArgs {
    #[clap(flatten)]
    user: UserId,

    /// The new monthly limit in the user's currency, e.g. 25000
    amount: Amount,
}

impl LimitSetArgs {
    pub fn new(user: i64, amount: Amount) -> Self {
        Self {
            user: UserId::new(user),
            amount,
        }
    }

    pub fn user(&self) -> i64 {
        self.user.user()
    }

    pub fn amount(&self) -> Amount {
        self.amount
    }
}

/// (Not shown): Args for the `spendbook currency` command.
#[derive(Debug, Parser, Clone)]
pub struct CurrencyArgs {
    #[command(subcommand)]
    action: CurrencySubcommand,
}

impl CurrencyArgs {
    pub fn new(action: CurrencySubcommand) -> Self {
        Self { action }
    }

    pub fn action(&self) -> &CurrencySubcommand {
        &self.action
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum CurrencySubcommand {
    /// List the supported currencies and their current rates.
    List,
    /// Fetch current exchange rates once.
    Refresh,
    /// Change the currency a user enters and reads amounts in.
    Set(CurrencySetArgs),
}

/// (Not shown): Args for the `spendbook currency set` command.
#[derive(Debug, Parser, Clone)]
pub struct CurrencySetArgs {
    #[clap(flatten)]
    user: UserId,

    /// A currency code from the configured list, e.g. USD
    code: String,
}

impl CurrencySetArgs {
    pub fn new(user: i64, code: impl Into<String>) -> Self {
        Self {
            user: UserId::new(user),
            code: code.into(),
        }
    }

    pub fn user(&self) -> i64 {
        self.user.user()
    }

    pub fn code(&self) -> &str {
        &self.code
    }
}

/// (Not shown): Args for the `spendbook report` command.
#[derive(Debug, Parser, Clone)]
pub struct ReportArgs {
    #[clap(flatten)]
    user: UserId,

    /// The period to report on: day, week, month, year or all
    #[arg(long, default_value_t = Period::Month)]
    period: Period,

    /// Compute the report with an in-process worker instead of waiting for `spendbook worker`.
    #[arg(long)]
    local: bool,
}

impl ReportArgs {
    pub fn new(user: i64, period: Period, local: bool) -> Self {
        Self {
            user: UserId::new(user),
            period,
            local,
        }
    }

    pub fn user(&self) -> i64 {
        self.user.user()
    }

    pub fn period(&self) -> Period {
        self.period
    }

    pub fn local(&self) -> bool {
        self.local
    }
}

/// (Not shown): Args for the `spendbook worker` command.
#[derive(Debug, Parser, Clone)]
pub struct WorkerArgs {
    /// Also refresh exchange rates on the configured interval.
    #[arg(long)]
    refresh_rates: bool,

    /// Also restore every user's current limit at the start of each month.
    #[arg(long)]
    reset_limits: bool,
}

impl WorkerArgs {
    pub fn new(refresh_rates: bool, reset_limits: bool) -> Self {
        Self {
            refresh_rates,
            reset_limits,
        }
    }

    pub fn refresh_rates(&self) -> bool {
        self.refresh_rates
    }

    pub fn reset_limits(&self) -> bool {
        self.reset_limits
    }
}

/// A point in time given on the command line, either a date (midnight UTC) or RFC 3339.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Timestamp(DateTime<Utc>);

impl FromStr for Timestamp {
    type Err = chrono::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match NaiveDate::parse_from_str(s, "%Y-%m-%d") {
            Ok(date) => Ok(Self(date.and_hms_opt(0, 0, 0).unwrap_or_default().and_utc())),
            Err(_) => Ok(Self(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))),
        }
    }
}

fn default_spendbook_home() -> DisplayPath {
    DisplayPath(match dirs::home_dir() {
        Some(home) => home.join("spendbook"),
        None => {
            error!(
                "There was an error when trying to get your home directory. You can get around \
                this by providing --home or SPENDBOOK_HOME instead of relying on the default \
                spendbook home directory. If you continue using the program right now, you may \
                have problems!",
            );
            PathBuf::from("spendbook")
        }
    })
}

#[derive(Debug, Default, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DisplayPath(PathBuf);

impl From<PathBuf> for DisplayPath {
    fn from(value: PathBuf) -> Self {
        DisplayPath(value)
    }
}

impl Deref for DisplayPath {
    type Target = Path;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsRef<Path> for DisplayPath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

impl Display for DisplayPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_string_lossy())
    }
}

impl FromStr for DisplayPath {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(PathBuf::from(s)))
    }
}

impl DisplayPath {
    pub fn new(path: PathBuf) -> Self {
        Self(path)
    }

    pub fn path(&self) -> &Path {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("spendbook").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_expense_add() {
        let args = parse(&[
            "--home",
            "/tmp/sb",
            "expense",
            "add",
            "--user",
            "7",
            "food",
            "12.50",
            "--date",
            "2024-03-05",
        ]);
        assert_eq!(args.common().home().path(), Path::new("/tmp/sb"));
        let Command::Expense(expense) = args.command() else {
            panic!("wrong command: {:?}", args.command());
        };
        let ExpenseSubcommand::Add(add) = expense.action();
        assert_eq!(add.user(), 7);
        assert_eq!(add.category(), "food");
        assert_eq!(add.amount(), Amount::from_minor(1250));
        assert_eq!(
            add.date(),
            Some(Utc.with_ymd_and_hms(2024, 3, 5, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_report_defaults_to_month() {
        let args = parse(&["report", "--user", "1"]);
        let Command::Report(report) = args.command() else {
            panic!("wrong command: {:?}", args.command());
        };
        assert_eq!(report.period(), Period::Month);
        assert!(!report.local());

        let args = parse(&["report", "--user", "1", "--period", "week", "--local"]);
        let Command::Report(report) = args.command() else {
            panic!("wrong command: {:?}", args.command());
        };
        assert_eq!(report.period(), Period::Week);
        assert!(report.local());
    }

    #[test]
    fn test_timestamp() {
        let ts: Timestamp = "2024-03-05T10:30:00+03:00".parse().unwrap();
        assert_eq!(ts.0, Utc.with_ymd_and_hms(2024, 3, 5, 7, 30, 0).unwrap());
        assert!("yesterday".parse::<Timestamp>().is_err());
    }
}
