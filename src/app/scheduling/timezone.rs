use chrono::offset::LocalResult;
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

/// Invalid zone names, impossible calendar dates, or arithmetic that walks
/// off the supported range.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum InvalidTimeSpec {
    #[error("unknown or unsupported timezone: {0}")]
    UnknownZone(String),

    #[error("invalid calendar date {year:04}-{month:02}-{day:02}")]
    InvalidDate { year: i32, month: u32, day: u32 },

    #[error("no event date in field {0}")]
    MissingEventDate(&'static str),

    #[error("no representable instant for {local} in {zone}")]
    Unrepresentable { local: NaiveDateTime, zone: String },
}

/// All conversions between a user's calendar intent and absolute UTC
/// instants. Everything here is pure; time comes in as an argument.
pub struct TimezoneEngine;

impl TimezoneEngine {
    /// Resolves an IANA zone name. Bare abbreviations like `EST` or `PST`
    /// are rejected even though the tz database still ships them; `UTC` is
    /// the one region-less name accepted.
    pub fn validate_zone(name: &str) -> Result<Tz, InvalidTimeSpec> {
        if name != "UTC" && !name.contains('/') {
            return Err(InvalidTimeSpec::UnknownZone(name.to_string()));
        }
        name.parse::<Tz>()
            .map_err(|_| InvalidTimeSpec::UnknownZone(name.to_string()))
    }

    /// The calendar date it currently is for someone in `zone`.
    pub fn local_today(zone: Tz, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&zone).date_naive()
    }

    /// The local calendar date of an absolute instant in `zone`.
    pub fn local_date(instant: DateTime<Utc>, zone: Tz) -> NaiveDate {
        instant.with_timezone(&zone).date_naive()
    }

    /// True iff the local today in `zone` matches the event's month and day.
    /// A Feb 29 event in a non-leap local year matches Feb 28 (and only
    /// Feb 28, so year boundaries cannot double-fire).
    pub fn is_event_today(event_date: NaiveDate, zone: Tz, now: DateTime<Utc>) -> bool {
        let today = Self::local_today(zone, now);
        let (month, day) = Self::occurrence_month_day(event_date, today.year());
        (today.month(), today.day()) == (month, day)
    }

    /// The wall-clock 09:00 (or any hour:minute) of this year's occurrence
    /// of `event_date` in `zone`, resolved to a UTC instant. The year comes
    /// from the user's current local date, never from the event itself.
    ///
    /// DST policy: a wall clock inside a spring-forward gap resolves to the
    /// first instant after the gap; a wall clock inside a fall-back overlap
    /// resolves to the earlier of the two candidates.
    pub fn calculate_send_time(
        event_date: NaiveDate,
        zone: Tz,
        now: DateTime<Utc>,
        hour: u32,
        minute: u32,
    ) -> Result<DateTime<Utc>, InvalidTimeSpec> {
        let year = Self::local_today(zone, now).year();
        let (month, day) = Self::occurrence_month_day(event_date, year);

        let date = NaiveDate::from_ymd_opt(year, month, day)
            .ok_or(InvalidTimeSpec::InvalidDate { year, month, day })?;
        let local = date
            .and_hms_opt(hour, minute, 0)
            .ok_or(InvalidTimeSpec::InvalidDate { year, month, day })?;

        Self::resolve_local(local, zone)
    }

    /// An absolute instant rendered as a local date-time in `zone`.
    pub fn convert_zone(instant: DateTime<Utc>, zone: Tz) -> NaiveDateTime {
        instant.with_timezone(&zone).naive_local()
    }

    /// Maps a local wall-clock time to UTC under the documented DST policy.
    fn resolve_local(local: NaiveDateTime, zone: Tz) -> Result<DateTime<Utc>, InvalidTimeSpec> {
        match zone.from_local_datetime(&local) {
            LocalResult::Single(dt) => Ok(dt.with_timezone(&Utc)),
            // Fall-back overlap: the first occurrence of the wall clock wins.
            LocalResult::Ambiguous(earlier, _later) => Ok(earlier.with_timezone(&Utc)),
            // Spring-forward gap: walk forward minute by minute to the first
            // existing wall clock. Real transitions are at most a few hours;
            // the bound only exists to turn a tz-database surprise into an
            // error instead of a spin.
            LocalResult::None => {
                let mut probe = local;
                for _ in 0..(26 * 60) {
                    probe = probe + Duration::minutes(1);
                    match zone.from_local_datetime(&probe) {
                        LocalResult::Single(dt) => return Ok(dt.with_timezone(&Utc)),
                        LocalResult::Ambiguous(earlier, _) => return Ok(earlier.with_timezone(&Utc)),
                        LocalResult::None => continue,
                    }
                }
                Err(InvalidTimeSpec::Unrepresentable {
                    local,
                    zone: zone.name().to_string(),
                })
            }
        }
    }

    /// The month and day on which `event_date` occurs in `year`, clamping
    /// Feb 29 to Feb 28 when `year` is not a leap year.
    fn occurrence_month_day(event_date: NaiveDate, year: i32) -> (u32, u32) {
        if event_date.month() == 2 && event_date.day() == 29 && !is_leap_year(year) {
            (2, 28)
        } else {
            (event_date.month(), event_date.day())
        }
    }
}

fn is_leap_year(year: i32) -> bool {
    NaiveDate::from_ymd_opt(year, 2, 29).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bare_abbreviations() {
        assert!(TimezoneEngine::validate_zone("EST").is_err());
        assert!(TimezoneEngine::validate_zone("PST").is_err());
        assert!(TimezoneEngine::validate_zone("nonsense").is_err());
    }

    #[test]
    fn accepts_utc_and_region_names() {
        assert!(TimezoneEngine::validate_zone("UTC").is_ok());
        assert!(TimezoneEngine::validate_zone("America/New_York").is_ok());
        assert!(TimezoneEngine::validate_zone("Asia/Kathmandu").is_ok());
    }

    #[test]
    fn leap_day_clamps_to_feb_28_in_common_years() {
        let event = NaiveDate::from_ymd_opt(2000, 2, 29).unwrap();
        assert_eq!(TimezoneEngine::occurrence_month_day(event, 2025), (2, 28));
        assert_eq!(TimezoneEngine::occurrence_month_day(event, 2024), (2, 29));
    }
}
