use anyhow::Result;
use dotenv::dotenv;
use std::env;
use std::path::Path;

pub mod app;
pub mod database;
pub mod delivery;
pub mod scheduler;
pub mod worker;

#[derive(Debug, Clone)]
pub struct Config {
    pub app: app::AppConfig,
    pub database: database::DatabaseConfig,
    pub scheduler: scheduler::SchedulerConfig,
    pub worker: worker::WorkerConfig,
    pub delivery: delivery::DeliveryConfig,
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_dotenv();

        Ok(Config {
            app: app::AppConfig::from_env()?,
            database: database::DatabaseConfig::from_env()?,
            scheduler: scheduler::SchedulerConfig::from_env()?,
            worker: worker::WorkerConfig::from_env()?,
            delivery: delivery::DeliveryConfig::from_env()?,
        })
    }

    pub fn from_env() -> Result<Self> {
        Self::load()
    }

    fn load_dotenv() {
        let env_file = match env::var("APP_ENV").unwrap_or_else(|_| "local".to_string()).as_str() {
            "production" => ".env.production",
            "staging" => ".env.staging",
            "testing" => ".env.testing",
            _ => ".env",
        };

        if Path::new(env_file).exists() {
            dotenv::from_filename(env_file).ok();
        } else {
            dotenv().ok();
        }
    }

    pub fn is_production(&self) -> bool {
        self.app.is_production()
    }

    pub fn is_testing(&self) -> bool {
        self.app.is_testing()
    }
}
