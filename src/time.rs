use chrono::{DateTime, Duration, Utc};

pub const DAY_MS: i64 = 24 * 60 * 60 * 1000;

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub fn to_date(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// `YYYYMMDD-HHMMSS` in UTC, used for file name suffixes.
pub fn compact_stamp(ms: i64) -> String {
    to_date(ms).format("%Y%m%d-%H%M%S").to_string()
}

/// Calendar date (`YYYY-MM-DD`) `days` days before `now_ms`.
pub fn date_days_ago(now_ms: i64, days: i64) -> String {
    (to_date(now_ms) - Duration::days(days))
        .format("%Y-%m-%d")
        .to_string()
}
