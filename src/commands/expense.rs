use crate::args::ExpenseAddArgs;
use crate::commands::{ledger, Out};
use crate::ledger::LimitStatus;
use crate::{Config, Result};
use chrono::Utc;

/// Records an expense and reports what is left of the monthly limit.
pub async fn expense_add(config: &Config, args: &ExpenseAddArgs) -> Result<Out<LimitStatus>> {
    let ledger = ledger(config);
    let timestamp = args.date().unwrap_or_else(Utc::now);
    ledger
        .write_expense(args.user(), args.category(), args.amount(), timestamp)
        .await?;
    let status = ledger.limit_status(args.user()).await?;
    Ok(Out::new(
        format!(
            "Recorded {} {} under '{}', {} {} left this month",
            args.amount(),
            status.currency,
            args.category(),
            status.remaining,
            status.currency
        ),
        status,
    ))
}
