use crate::args::CategoryAddArgs;
use crate::commands::{ledger, Out};
use crate::{Config, Result};

/// Adds a category for a user. An existing category is not an error.
pub async fn category_add(config: &Config, args: &CategoryAddArgs) -> Result<Out<bool>> {
    let created = ledger(config).add_category(args.user(), args.name()).await?;
    let message = if created {
        format!("Added category '{}'", args.name())
    } else {
        format!("Category '{}' already exists", args.name())
    };
    Ok(Out::new(message, created))
}
