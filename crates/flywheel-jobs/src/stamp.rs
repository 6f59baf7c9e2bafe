//! Timestamps and unique submission stamps.
//!
//! Every queue submission and every model-run attempt is identified by a
//! millisecond stamp formatted as `YYYY_MM_DD_hh_mm_ss_SSS`. The format sorts
//! lexicographically in time order, which the file protocol relies on.

use std::sync::Mutex;

use chrono::DateTime;
use chrono::NaiveDateTime;
use chrono::TimeZone;
use chrono::Utc;

/// The chrono format string for stamps.
const STAMP_FORMAT: &str = "%Y_%m_%d_%H_%M_%S_%3f";

/// The fixed character length of a well-formed stamp.
pub const STAMP_LEN: usize = 23;

/// The last stamp handed out, in epoch milliseconds.
///
/// Guards uniqueness and monotonicity of submission stamps within a process:
/// two submissions in the same millisecond get consecutive stamps.
static LAST_ISSUED_MS: Mutex<i64> = Mutex::new(0);

/// Formats the given epoch milliseconds as a stamp.
pub fn from_millis(ms: i64) -> String {
    let ts = Utc
        .timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(Utc::now);
    ts.format(STAMP_FORMAT).to_string()
}

/// Parses a stamp back into epoch milliseconds.
///
/// Returns `None` if the input does not follow the stamp grammar.
pub fn to_millis(stamp: &str) -> Option<i64> {
    if stamp.len() != STAMP_LEN {
        return None;
    }

    NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc().timestamp_millis())
}

/// Returns a stamp for the current instant without any uniqueness guarantee.
///
/// Use [`new_stamp`] for submission stamps.
pub fn now_stamp() -> String {
    format_time(Utc::now())
}

/// Formats an arbitrary time as a stamp.
pub fn format_time(time: DateTime<Utc>) -> String {
    time.format(STAMP_FORMAT).to_string()
}

/// Issues a new unique, monotonically increasing submission stamp.
///
/// If the wall clock has not advanced past the previously issued stamp (or has
/// moved backwards), the stamp is bumped one millisecond past the last one.
pub fn new_stamp() -> String {
    let now = Utc::now().timestamp_millis();
    let mut last = LAST_ISSUED_MS.lock().expect("stamp lock poisoned");

    let issued = if now > *last { now } else { *last + 1 };
    *last = issued;

    from_millis(issued)
}

/// Returns the `YYYY_MM` month prefix of a stamp, used to key `past/`
/// subdirectories.
pub fn month_of(stamp: &str) -> Option<&str> {
    if stamp.len() != STAMP_LEN {
        return None;
    }

    Some(&stamp[..7])
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn round_trip() {
        let ms = 1_700_000_123_456;
        let stamp = from_millis(ms);
        assert_eq!(stamp.len(), STAMP_LEN);
        assert_eq!(to_millis(&stamp), Some(ms));
    }

    #[test]
    fn rejects_malformed() {
        assert_eq!(to_millis("2024-01-01"), None);
        assert_eq!(to_millis("2024_01_01_00_00_00_00"), None);
    }

    #[test]
    fn stamps_are_unique_and_increasing() {
        let mut prev = new_stamp();
        for _ in 0..100 {
            let next = new_stamp();
            assert!(next > prev, "{next} should sort after {prev}");
            prev = next;
        }
    }

    #[test]
    fn month_prefix() {
        let stamp = from_millis(1_700_000_123_456);
        assert_eq!(month_of(&stamp), Some("2023_11"));
        assert_eq!(month_of("bogus"), None);
    }
}
