use crate::commands::{ledger, Out};
use crate::{Config, Result};

/// Registers `user_id`. Registering an existing user changes nothing.
pub async fn user_add(config: &Config, user_id: i64) -> Result<Out<bool>> {
    let created = ledger(config).add_user(user_id).await?;
    let message = if created {
        format!("Added user {user_id}")
    } else {
        format!("User {user_id} already exists")
    };
    Ok(Out::new(message, created))
}

/// Erases `user_id` with all of their categories and expenses.
pub async fn user_reset(config: &Config, user_id: i64) -> Result<Out<()>> {
    ledger(config).reset_user(user_id).await?;
    Ok(Out::new_message(format!("Erased user {user_id}")))
}
