use anyhow::Result;

use crate::{config, database};

pub async fn handle_migrate_command() -> Result<()> {
    println!("Running database migrations...");

    let config = config::Config::load()?;
    let pool = database::create_pool(&config)?;
    database::run_migrations(&pool)?;

    println!("Migrations completed successfully.");
    Ok(())
}
