//! Shared version and time helpers.

use chrono::{DateTime, Duration, Utc};

/// Seconds between 1900-01-01T00:00:00Z and the Unix epoch.
const STARTING_EPOCH_OFFSET_SECS: i64 = 2_208_988_800;

/// The rules version of a project that has no rules, not even inactive ones.
///
/// Deliberately distinct from the Unix epoch so that an unpopulated timestamp
/// is never mistaken for a real version. Every store-assigned version is
/// strictly greater than this.
pub fn starting_epoch() -> DateTime<Utc> {
    DateTime::UNIX_EPOCH - Duration::seconds(STARTING_EPOCH_OFFSET_SECS)
}

/// The refresh time of a ruleset that has never been loaded.
pub fn zero_time() -> DateTime<Utc> {
    DateTime::UNIX_EPOCH
}

/// Milliseconds since UNIX epoch, used for operation timing.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_starting_epoch_is_1900() {
        let expected = Utc.with_ymd_and_hms(1900, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(starting_epoch(), expected);
        assert!(starting_epoch() < zero_time());
    }
}
