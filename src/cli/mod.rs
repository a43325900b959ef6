pub mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "wellwisher")]
#[command(about = "Timezone-aware greeting delivery service")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the full delivery pipeline (schedulers, workers, recovery)
    Serve,
    /// Run database migrations
    Migrate,
    /// Force one daily precomputation pass
    #[command(name = "schedule:run")]
    ScheduleRun,
    /// Force one recovery pass over stuck logs
    #[command(name = "recover:run")]
    RecoverRun,
    /// Show queue depths for every registered message type
    #[command(name = "queue:stats")]
    QueueStats,
    /// Delete dead-letter jobs older than the given number of days
    #[command(name = "queue:prune")]
    QueuePrune {
        #[arg(long, default_value = "30")]
        days: u32,
    },
    /// Move everything in a queue's dead-letter companion back onto it
    #[command(name = "dlq:requeue")]
    DlqRequeue {
        /// Primary queue name (e.g. birthday_messages)
        queue: String,
    },
    /// Show message log counts per status
    #[command(name = "logs:status")]
    LogsStatus,
}

pub async fn run_cli(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Serve => commands::serve::handle_serve_command().await,
        Commands::Migrate => commands::migrate::handle_migrate_command().await,
        Commands::ScheduleRun => commands::schedule::handle_schedule_run_command().await,
        Commands::RecoverRun => commands::recover::handle_recover_run_command().await,
        Commands::QueueStats => commands::queue::handle_queue_stats_command().await,
        Commands::QueuePrune { days } => commands::queue::handle_queue_prune_command(days).await,
        Commands::DlqRequeue { queue } => commands::queue::handle_dlq_requeue_command(queue).await,
        Commands::LogsStatus => commands::logs::handle_logs_status_command().await,
    }
}
