use chrono::{NaiveDate, TimeZone, Utc};
use std::sync::Arc;
use wellwisher::app::models::User;
use wellwisher::app::scheduling::timezone::TimezoneEngine;
use wellwisher::app::strategies::{
    AnniversaryStrategy, BirthdayStrategy, Cadence, ComposeContext, MessageStrategy,
    StrategyRegistry,
};

fn date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).unwrap()
}

fn user_in(zone: &str) -> User {
    let mut user = User::new(
        "Grace".to_string(),
        "Hopper".to_string(),
        "grace@example.com".to_string(),
        zone.to_string(),
    );
    user.birthday_date = Some(date(1906, 12, 9));
    user.anniversary_date = Some(date(2020, 6, 15));
    user
}

#[test]
fn builtins_are_registered_with_yearly_morning_schedules() {
    let registry = StrategyRegistry::with_builtins();
    assert_eq!(registry.len(), 2);

    for key in ["BIRTHDAY", "ANNIVERSARY"] {
        let strategy = registry.get(key).expect(key);
        let schedule = strategy.schedule();
        assert_eq!(schedule.cadence, Cadence::Yearly);
        assert_eq!(schedule.send_hour_local, 9);
        assert_eq!(schedule.send_minute_local, 0);
    }
}

#[test]
fn re_registering_a_key_replaces_the_strategy() {
    struct LoudBirthdays;

    impl MessageStrategy for LoudBirthdays {
        fn message_type(&self) -> &'static str {
            "BIRTHDAY"
        }

        fn trigger_field(&self) -> &'static str {
            "birthday_date"
        }

        fn compose_message(&self, user: &User, _ctx: &ComposeContext) -> String {
            format!("HAPPY BIRTHDAY {}!!!", user.first_name.to_uppercase())
        }
    }

    let mut registry = StrategyRegistry::with_builtins();
    registry.register(Arc::new(LoudBirthdays));
    assert_eq!(registry.len(), 2);

    let user = user_in("UTC");
    let zone = TimezoneEngine::validate_zone("UTC").unwrap();
    let ctx = ComposeContext { local_date: date(2025, 12, 9), zone };
    let strategy = registry.get("BIRTHDAY").unwrap();
    assert_eq!(strategy.compose_message(&user, &ctx), "HAPPY BIRTHDAY GRACE!!!");
}

#[test]
fn should_send_matches_only_the_local_event_day() {
    let strategy = BirthdayStrategy;
    let user = user_in("UTC");
    let zone = TimezoneEngine::validate_zone("UTC").unwrap();

    let on_day = Utc.with_ymd_and_hms(2025, 12, 9, 3, 0, 0).unwrap();
    assert!(strategy.should_send(&user, zone, on_day));

    let off_day = Utc.with_ymd_and_hms(2025, 12, 10, 3, 0, 0).unwrap();
    assert!(!strategy.should_send(&user, zone, off_day));
}

#[test]
fn should_send_is_false_without_the_trigger_field() {
    let strategy = AnniversaryStrategy;
    let mut user = user_in("UTC");
    user.anniversary_date = None;
    let zone = TimezoneEngine::validate_zone("UTC").unwrap();
    let now = Utc.with_ymd_and_hms(2025, 6, 15, 3, 0, 0).unwrap();

    assert!(!strategy.should_send(&user, zone, now));
}

#[test]
fn send_time_honors_the_users_zone() {
    let strategy = BirthdayStrategy;
    let user = user_in("Asia/Kathmandu");
    let zone = TimezoneEngine::validate_zone(&user.timezone).unwrap();
    let now = Utc.with_ymd_and_hms(2025, 12, 9, 0, 0, 0).unwrap();

    let send = strategy.calculate_send_time(&user, zone, now).unwrap();
    assert_eq!(send, Utc.with_ymd_and_hms(2025, 12, 9, 3, 15, 0).unwrap());
}

#[test]
fn birthday_message_uses_the_full_name() {
    let strategy = BirthdayStrategy;
    let user = user_in("UTC");
    let zone = TimezoneEngine::validate_zone("UTC").unwrap();
    let ctx = ComposeContext { local_date: date(2025, 12, 9), zone };

    assert_eq!(
        strategy.compose_message(&user, &ctx),
        "Hey, Grace Hopper it's your birthday!"
    );
}

#[test]
fn anniversary_message_counts_years_from_the_start_date() {
    let strategy = AnniversaryStrategy;
    let user = user_in("UTC");
    let zone = TimezoneEngine::validate_zone("UTC").unwrap();
    let ctx = ComposeContext { local_date: date(2025, 6, 15), zone };

    assert_eq!(
        strategy.compose_message(&user, &ctx),
        "Hey, Grace Hopper! Congratulations on 5 years with us!"
    );

    let first = ComposeContext { local_date: date(2021, 6, 15), zone };
    assert_eq!(
        strategy.compose_message(&user, &first),
        "Hey, Grace Hopper! Congratulations on 1 year with us!"
    );
}

#[test]
fn validation_flags_missing_fields_and_bad_zones() {
    let strategy = BirthdayStrategy;

    let mut user = user_in("UTC");
    user.birthday_date = None;
    let errors = strategy.validate(&user).unwrap_err();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("birthday_date"));

    let mut user = user_in("EST");
    user.birthday_date = Some(date(1990, 1, 1));
    let errors = strategy.validate(&user).unwrap_err();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("timezone"));

    assert!(strategy.validate(&user_in("UTC")).is_ok());
}
