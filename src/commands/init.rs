use crate::commands::Out;
use crate::{Config, Result};
use std::path::Path;
use tracing::info;

/// Creates the data directory with:
/// - an initial `config.json` file with default settings
/// - the SQLite database, seeded with the default currencies at a rate of 1
///
/// # Arguments
/// - `home` - The directory that will be the root of data directory, e.g. `$HOME/spendbook`
/// - `exist_ok` - Succeed without changes if `home` already holds a config file.
///
/// # Errors
/// - Returns an error if any file operations fail.
pub async fn init(home: &Path, exist_ok: bool) -> Result<Out<()>> {
    if exist_ok && home.join("config.json").is_file() {
        let config = Config::load(home).await?;
        info!("Spendbook is already initialized at {}", config.root().display());
        return Ok("The spendbook directory already exists".into());
    }
    let config = Config::create(home).await?;
    Ok(Out::new_message(format!(
        "Successfully created the spendbook directory at {}",
        config.root().display()
    )))
}
