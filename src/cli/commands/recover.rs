use anyhow::Result;
use std::sync::Arc;

use crate::app::scheduling::{RecoveryLoop, SystemClock};
use crate::app::services::DatabaseMessageLogStore;
use crate::{config, database};

pub async fn handle_recover_run_command() -> Result<()> {
    let config = config::Config::load()?;
    let pool = database::create_pool(&config)?;

    let recovery = RecoveryLoop::new(
        Arc::new(DatabaseMessageLogStore::new(pool)),
        Arc::new(SystemClock),
        config.scheduler.recovery_grace,
        config.scheduler.max_retries,
    );

    let summary = recovery.run_once().await?;
    println!(
        "Recovery done: {} reopened, {} closed as failed",
        summary.reopened, summary.failed
    );
    Ok(())
}
