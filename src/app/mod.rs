pub mod delivery;
pub mod jobs;
pub mod models;
pub mod scheduling;
pub mod services;
pub mod strategies;
