//! Next-fire computation.
//!
//! Without a time-of-day anchor a repeater fires every `interval`. With one,
//! the first fire is the next occurrence of that wall-clock time in the
//! guild's zone, and each later fire is the first occurrence at least
//! `interval` after the previous one.

use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use std::time::Duration;

/// Far beyond the longest allowed interval.
const MAX_LOOKAHEAD_DAYS: i64 = 400;

/// Fire time for a freshly started or reset schedule.
pub fn first_fire(
    now: DateTime<Utc>,
    interval: Duration,
    start_time_of_day: Option<NaiveTime>,
    tz: Tz,
) -> DateTime<Utc> {
    match start_time_of_day {
        Some(time) => next_occurrence(now, time, tz, Duration::ZERO),
        None => now + to_chrono(interval),
    }
}

/// Fire time following a fire (natural or manual) that happened at `now`.
pub fn following_fire(
    now: DateTime<Utc>,
    interval: Duration,
    start_time_of_day: Option<NaiveTime>,
    tz: Tz,
) -> DateTime<Utc> {
    match start_time_of_day {
        Some(time) => next_occurrence(now, time, tz, interval),
        None => now + to_chrono(interval),
    }
}

/// First instant strictly after `now` and at least `min_gap` after it at
/// which the wall clock in `tz` reads `time`.
fn next_occurrence(now: DateTime<Utc>, time: NaiveTime, tz: Tz, min_gap: Duration) -> DateTime<Utc> {
    let threshold = now + to_chrono(min_gap);
    // Start a day early: the threshold's local date may already be past the
    // anchor while the previous local day's occurrence is not.
    let first_day = threshold.with_timezone(&tz).date_naive() - chrono::Duration::days(1);

    (0..=MAX_LOOKAHEAD_DAYS)
        .filter_map(|offset| local_to_utc(first_day + chrono::Duration::days(offset), time, tz))
        .find(|candidate| *candidate > now && *candidate >= threshold)
        .unwrap_or(threshold)
}

/// Resolves a local wall-clock time. Ambiguous times (DST fall-back) take the
/// earlier instant; skipped times (DST spring-forward) shift one hour later.
fn local_to_utc(day: NaiveDate, time: NaiveTime, tz: Tz) -> Option<DateTime<Utc>> {
    let local = day.and_time(time);
    tz.from_local_datetime(&local)
        .earliest()
        .or_else(|| {
            tz.from_local_datetime(&(local + chrono::Duration::hours(1)))
                .earliest()
        })
        .map(|dt| dt.with_timezone(&Utc))
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::seconds(d.as_secs() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn hm(h: u32, m: u32) -> Option<NaiveTime> {
        NaiveTime::from_hms_opt(h, m, 0)
    }

    #[test]
    fn test_rolling_interval() {
        let now = utc("2026-03-01T10:00:00Z");
        let five_min = Duration::from_secs(300);
        assert_eq!(first_fire(now, five_min, None, Tz::UTC), utc("2026-03-01T10:05:00Z"));
        assert_eq!(following_fire(now, five_min, None, Tz::UTC), utc("2026-03-01T10:05:00Z"));
    }

    #[test]
    fn test_first_fire_uses_next_occurrence() {
        let interval = Duration::from_secs(3600);
        let before = utc("2026-03-01T08:00:00Z");
        assert_eq!(first_fire(before, interval, hm(9, 30), Tz::UTC), utc("2026-03-01T09:30:00Z"));

        let after = utc("2026-03-01T10:00:00Z");
        assert_eq!(first_fire(after, interval, hm(9, 30), Tz::UTC), utc("2026-03-02T09:30:00Z"));

        let exactly = utc("2026-03-01T09:30:00Z");
        assert_eq!(first_fire(exactly, interval, hm(9, 30), Tz::UTC), utc("2026-03-02T09:30:00Z"));
    }

    #[test]
    fn test_following_fire_respects_interval() {
        let now = utc("2026-03-01T09:30:00Z");
        // Shorter than a day: the next daily occurrence.
        assert_eq!(
            following_fire(now, Duration::from_secs(600), hm(9, 30), Tz::UTC),
            utc("2026-03-02T09:30:00Z")
        );
        // Two days: the first occurrence at least two days out.
        assert_eq!(
            following_fire(now, Duration::from_secs(2 * 86_400), hm(9, 30), Tz::UTC),
            utc("2026-03-03T09:30:00Z")
        );
        // Just over a day skips to the day after.
        assert_eq!(
            following_fire(now, Duration::from_secs(86_400 + 60), hm(9, 30), Tz::UTC),
            utc("2026-03-03T09:30:00Z")
        );
    }

    #[test]
    fn test_guild_timezone() {
        let tz: Tz = "America/New_York".parse().unwrap();
        // 13:00 UTC is 08:00 EST.
        let now = utc("2026-01-15T13:00:00Z");
        assert_eq!(
            first_fire(now, Duration::from_secs(60), hm(9, 0), tz),
            utc("2026-01-15T14:00:00Z")
        );
    }

    #[test]
    fn test_spring_forward_gap_shifts_an_hour() {
        let tz: Tz = "America/New_York".parse().unwrap();
        // 02:30 does not exist on 2026-03-08 in New York.
        let now = utc("2026-03-08T05:00:00Z");
        assert_eq!(
            first_fire(now, Duration::from_secs(60), hm(2, 30), tz),
            utc("2026-03-08T07:30:00Z")
        );
    }
}
