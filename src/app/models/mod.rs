pub mod diesel_ulid;
pub mod message_log;
pub mod user;

pub use diesel_ulid::DieselUlid;
pub use message_log::{MessageLog, MessageStatus, NewMessageLog};
pub use user::User;
