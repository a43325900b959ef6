use anyhow::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::app::delivery::HttpDeliveryClient;
use crate::app::jobs::DatabaseQueueDriver;
use crate::app::scheduling::{Pipeline, SystemClock};
use crate::app::services::{DatabaseMessageLogStore, DatabaseUserRepository};
use crate::app::strategies::StrategyRegistry;
use crate::{config, database};

pub async fn handle_serve_command() -> Result<()> {
    let config = config::Config::load()?;
    let pool = database::create_pool(&config)?;
    database::run_migrations(&pool)?;

    let registry = Arc::new(StrategyRegistry::with_builtins());
    let users = Arc::new(DatabaseUserRepository::new(pool.clone()));
    let store = Arc::new(DatabaseMessageLogStore::new(pool.clone()));
    let queue = Arc::new(DatabaseQueueDriver::new(pool.clone()));
    let delivery = Arc::new(HttpDeliveryClient::new(&config.delivery)?);
    let clock = Arc::new(SystemClock);

    let pipeline = Pipeline::new(registry, users, store, queue, delivery, clock, config);

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            info!("shutdown signal received, draining");
            cancel.cancel();
        }
    });

    pipeline.run(cancel).await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
