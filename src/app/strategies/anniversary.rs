use crate::app::models::User;

use super::{years_since, ComposeContext, MessageStrategy};

pub const ANNIVERSARY: &str = "ANNIVERSARY";

/// Yearly work-anniversary greeting, triggered by `anniversary_date`.
pub struct AnniversaryStrategy;

impl MessageStrategy for AnniversaryStrategy {
    fn message_type(&self) -> &'static str {
        ANNIVERSARY
    }

    fn trigger_field(&self) -> &'static str {
        "anniversary_date"
    }

    fn compose_message(&self, user: &User, ctx: &ComposeContext) -> String {
        match user.anniversary_date {
            Some(start) => {
                let years = years_since(start, ctx.local_date);
                format!(
                    "Hey, {}! Congratulations on {} year{} with us!",
                    user.full_name(),
                    years,
                    if years == 1 { "" } else { "s" },
                )
            }
            None => format!("Hey, {}! Happy anniversary!", user.full_name()),
        }
    }
}
