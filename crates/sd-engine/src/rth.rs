//! Regular-trading-hours check for US equities: 09:30–16:00 New York.
//!
//! The only timezone logic the engine needs is this one session window, so
//! the eastern offset is derived directly (EDT from the second Sunday of
//! March through the first Sunday of November, EST otherwise) instead of
//! pulling in a tzdata crate.

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Timelike, Utc, Weekday};

fn nth_sunday(year: i32, month: u32, n: u8) -> NaiveDate {
    NaiveDate::from_weekday_of_month_opt(year, month, Weekday::Sun, n)
        .expect("march/november always have the requested sunday")
}

/// UTC offset (hours, negative west) for US Eastern at the given UTC time.
fn eastern_offset_hours(utc: DateTime<Utc>) -> i32 {
    let year = utc.year();
    // DST switches at 2am local, i.e. 07:00 UTC entering and leaving.
    let dst_start = nth_sunday(year, 3, 2).and_hms_opt(7, 0, 0).unwrap();
    let dst_end = nth_sunday(year, 11, 1).and_hms_opt(6, 0, 0).unwrap();
    let naive = utc.naive_utc();
    if naive >= dst_start && naive < dst_end {
        -4
    } else {
        -5
    }
}

/// Whether a bar timestamp (ms since epoch) falls inside 09:30–16:00 ET on
/// a weekday. The session close itself (16:00:00) is outside.
pub fn is_rth(ts_ms: i64) -> bool {
    let Some(utc) = Utc.timestamp_millis_opt(ts_ms).single() else {
        return false;
    };
    let offset = eastern_offset_hours(utc);
    let local = utc + chrono::Duration::hours(i64::from(offset));
    if matches!(local.weekday(), Weekday::Sat | Weekday::Sun) {
        return false;
    }
    let minutes = local.hour() * 60 + local.minute();
    (9 * 60 + 30..16 * 60).contains(&minutes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> i64 {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap().timestamp_millis()
    }

    #[test]
    fn summer_session_uses_edt() {
        // 2026-07-15 is a Wednesday; 13:30 UTC == 09:30 EDT.
        assert!(is_rth(ts(2026, 7, 15, 13, 30)));
        assert!(!is_rth(ts(2026, 7, 15, 13, 29)));
        // 20:00 UTC == 16:00 EDT: session close is outside.
        assert!(!is_rth(ts(2026, 7, 15, 20, 0)));
        assert!(is_rth(ts(2026, 7, 15, 19, 59)));
    }

    #[test]
    fn winter_session_uses_est() {
        // 2026-01-14 is a Wednesday; 14:30 UTC == 09:30 EST.
        assert!(is_rth(ts(2026, 1, 14, 14, 30)));
        assert!(!is_rth(ts(2026, 1, 14, 14, 29)));
    }

    #[test]
    fn weekends_are_closed() {
        // 2026-07-18 is a Saturday.
        assert!(!is_rth(ts(2026, 7, 18, 15, 0)));
    }
}
