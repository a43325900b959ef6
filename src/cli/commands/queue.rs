use anyhow::Result;
use chrono::Utc;

use crate::app::jobs::{dead_letter_queue, primary_queue, DatabaseQueueDriver, QueueDriver};
use crate::app::strategies::StrategyRegistry;
use crate::{config, database};

pub async fn handle_queue_stats_command() -> Result<()> {
    let config = config::Config::load()?;
    let pool = database::create_pool(&config)?;
    let driver = DatabaseQueueDriver::new(pool);

    let registry = StrategyRegistry::with_builtins();
    for strategy in registry.iter() {
        let queue = primary_queue(strategy.message_type());
        let dlq = dead_letter_queue(&queue);
        let waiting = driver.size(&queue).await?;
        let dead = driver.size(&dlq).await?;
        println!("{queue}: {waiting} waiting, {dead} dead-lettered");
    }
    Ok(())
}

pub async fn handle_queue_prune_command(days: u32) -> Result<()> {
    let config = config::Config::load()?;
    let pool = database::create_pool(&config)?;
    let driver = DatabaseQueueDriver::new(pool);

    let cutoff = Utc::now() - chrono::Duration::days(days as i64);
    let registry = StrategyRegistry::with_builtins();
    let mut total = 0;
    for strategy in registry.iter() {
        let dlq = dead_letter_queue(&primary_queue(strategy.message_type()));
        total += driver.prune(&dlq, cutoff).await?;
    }
    println!("Pruned {total} dead-letter jobs older than {days} days.");
    Ok(())
}

pub async fn handle_dlq_requeue_command(queue: String) -> Result<()> {
    let config = config::Config::load()?;
    let pool = database::create_pool(&config)?;
    let driver = DatabaseQueueDriver::new(pool);

    let dlq = dead_letter_queue(&queue);
    let moved = driver.drain_to(&dlq, &queue).await?;
    println!("Requeued {moved} jobs from {dlq} onto {queue}.");
    Ok(())
}
