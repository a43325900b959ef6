use crate::app::models::User;

use super::{ComposeContext, MessageStrategy};

pub const BIRTHDAY: &str = "BIRTHDAY";

/// Yearly birthday greeting, triggered by `birthday_date`.
pub struct BirthdayStrategy;

impl MessageStrategy for BirthdayStrategy {
    fn message_type(&self) -> &'static str {
        BIRTHDAY
    }

    fn trigger_field(&self) -> &'static str {
        "birthday_date"
    }

    fn compose_message(&self, user: &User, _ctx: &ComposeContext) -> String {
        format!("Hey, {} it's your birthday!", user.full_name())
    }
}
