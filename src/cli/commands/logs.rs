use anyhow::Result;

use crate::app::services::message_log_service::MessageLogStore;
use crate::app::services::DatabaseMessageLogStore;
use crate::{config, database};

pub async fn handle_logs_status_command() -> Result<()> {
    let config = config::Config::load()?;
    let pool = database::create_pool(&config)?;
    let store = DatabaseMessageLogStore::new(pool);

    let counts = store.count_by_status().await?;
    if counts.is_empty() {
        println!("No message logs.");
        return Ok(());
    }
    for (status, count) in counts {
        println!("{status}: {count}");
    }
    Ok(())
}
