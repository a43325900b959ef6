use anyhow::Result;
use std::sync::Arc;

use crate::app::scheduling::{DailyScheduler, SystemClock};
use crate::app::services::{DatabaseMessageLogStore, DatabaseUserRepository};
use crate::app::strategies::StrategyRegistry;
use crate::{config, database};

pub async fn handle_schedule_run_command() -> Result<()> {
    let config = config::Config::load()?;
    let pool = database::create_pool(&config)?;

    let scheduler = DailyScheduler::new(
        Arc::new(StrategyRegistry::with_builtins()),
        Arc::new(DatabaseUserRepository::new(pool.clone())),
        Arc::new(DatabaseMessageLogStore::new(pool)),
        Arc::new(SystemClock),
    );

    let summary = scheduler.run_once().await?;
    println!(
        "Precomputation done: {} scheduled, {} already scheduled, {} skipped, {} errored",
        summary.scheduled, summary.already_scheduled, summary.skipped, summary.errored
    );
    Ok(())
}
