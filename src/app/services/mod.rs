pub mod message_log_service;
pub mod user_service;

pub use message_log_service::{
    DatabaseMessageLogStore, MemoryMessageLogStore, MessageLogStore, StatusUpdate, StoreError,
};
pub use user_service::{DatabaseUserRepository, MemoryUserRepository, UserRepository};
