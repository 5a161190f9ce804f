use clap::Parser;
use spendbook::args::{
    Args, CategorySubcommand, Command, CurrencySubcommand, ExpenseSubcommand, LimitSubcommand,
    UserSubcommand,
};
use spendbook::{commands, Config, Result};
use std::process::ExitCode;
use tracing::{debug, error, trace};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let log_level = args.common().log_level();
    init_logger(log_level);
    debug!("Log level set to {}", log_level.to_string().to_lowercase());

    match main_inner(args).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Exiting with error: {e}");
            ExitCode::FAILURE
        }
    }
}

pub async fn main_inner(args: Args) -> Result<()> {
    trace!("{args:?}");
    let home = args.common().home().path();

    let _: () = match args.command() {
        Command::Init(init_args) => commands::init(home, init_args.exist_ok()).await?.print(),

        Command::User(user_args) => {
            let config = Config::load(home).await?;
            match user_args.action() {
                UserSubcommand::Add(id) => commands::user_add(&config, id.user()).await?.print(),
                UserSubcommand::Reset(id) => {
                    commands::user_reset(&config, id.user()).await?.print()
                }
            }
        }

        Command::Category(category_args) => {
            let config = Config::load(home).await?;
            match category_args.action() {
                CategorySubcommand::Add(args) => {
                    commands::category_add(&config, args).await?.print()
                }
            }
        }

        Command::Expense(expense_args) => {
            let config = Config::load(home).await?;
            match expense_args.action() {
                ExpenseSubcommand::Add(args) => commands::expense_add(&config, args).await?.print(),
            }
        }

        Command::Limit(limit_args) => {
            let config = Config::load(home).await?;
            match limit_args.action() {
                LimitSubcommand::Show(id) => commands::limit_show(&config, id.user()).await?.print(),
                LimitSubcommand::Set(args) => commands::limit_set(&config, args).await?.print(),
                LimitSubcommand::Reset(id) => {
                    commands::limit_reset(&config, id.user()).await?.print()
                }
                LimitSubcommand::ResetAll => commands::limit_reset_all(&config).await?.print(),
            }
        }

        Command::Currency(currency_args) => {
            let config = Config::load(home).await?;
            match currency_args.action() {
                CurrencySubcommand::List => commands::currency_list(&config).await?.print(),
                CurrencySubcommand::Refresh => commands::currency_refresh(&config).await?.print(),
                CurrencySubcommand::Set(args) => {
                    commands::currency_set(&config, args).await?.print()
                }
            }
        }

        Command::Report(report_args) => {
            let config = Config::load(home).await?;
            commands::report(&config, report_args).await?.print()
        }

        Command::Worker(worker_args) => {
            let config = Config::load(home).await?;
            commands::worker(&config, worker_args).await?.print()
        }
    };
    Ok(())
}

/// Initializes the tracing subscriber.
pub fn init_logger(level: LevelFilter) {
    let filter = match std::env::var("RUST_LOG").ok() {
        Some(_) => {
            // RUST_LOG exists; use it.
            EnvFilter::from_default_env()
        }
        None => {
            // RUST_LOG does not exist; use default log level for this crate only.
            EnvFilter::new(format!(
                "{}={},{}={}",
                env!("CARGO_CRATE_NAME"),
                level,
                env!("CARGO_BIN_NAME"),
                level
            ))
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
