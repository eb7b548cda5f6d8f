//! Canonical timestamp handling.
//!
//! Every timestamp the engine persists or broadcasts is the same fixed-width string:
//! `YYYY-MM-DD HH:MM:SS` in Asia/Taipei (UTC+8, no DST), no fractional seconds, no zone
//! suffix. Inputs arrive as Unix seconds, Unix milliseconds, or wall-clock text.

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};

use crate::errors::EngineError;

pub const CANONICAL_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Unix values at or above this magnitude are treated as milliseconds.
const MILLIS_THRESHOLD: i64 = 10_000_000_000;

const TAIPEI_OFFSET_SECONDS: i32 = 8 * 3600;

fn taipei_offset() -> FixedOffset {
	FixedOffset::east_opt(TAIPEI_OFFSET_SECONDS).expect("+08:00 is in range")
}

fn canonical_regex() -> &'static regex::Regex {
	use std::sync::OnceLock;
	static RE: OnceLock<regex::Regex> = OnceLock::new();
	RE.get_or_init(|| {
		regex::Regex::new(r"^\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}$").expect("valid regex")
	})
}

/// Formats a Unix value (seconds or milliseconds, auto-detected by magnitude) as the
/// canonical Taipei string.
pub fn canonical_from_unix(value: i64) -> Result<String, EngineError> {
	if value <= 0 {
		return Err(EngineError::InvalidTimeInput(format!("non-positive unix value {value}")));
	}
	let (seconds, millis_part) = if value >= MILLIS_THRESHOLD {
		(value / 1000, (value % 1000) as u32)
	} else {
		(value, 0)
	};
	let instant = DateTime::<Utc>::from_timestamp(seconds, millis_part * 1_000_000)
		.ok_or_else(|| EngineError::InvalidTimeInput(format!("unix value {value} out of range")))?;
	Ok(canonical_from_datetime(instant))
}

/// Formats any `DateTime` as the canonical Taipei string.
pub fn canonical_from_datetime<Tz: TimeZone>(instant: DateTime<Tz>) -> String {
	instant.with_timezone(&taipei_offset()).format(CANONICAL_FORMAT).to_string()
}

/// The canonical string for the current wall clock.
pub fn canonical_now() -> String {
	canonical_from_datetime(Utc::now())
}

/// Parses wall-clock text. Canonical strings are taken as Taipei wall time; RFC 3339
/// strings are converted. Anything else is rejected.
pub fn canonical_from_text(input: &str) -> Result<String, EngineError> {
	let trimmed = input.trim();
	if trimmed.is_empty() {
		return Err(EngineError::InvalidTimeInput("empty input".to_string()));
	}
	if is_canonical(trimmed) {
		return Ok(trimmed.to_string());
	}
	if let Ok(instant) = DateTime::parse_from_rfc3339(trimmed) {
		return Ok(canonical_from_datetime(instant));
	}
	Err(EngineError::InvalidTimeInput(format!("unparseable time {trimmed:?}")))
}

/// True only for strings matching the canonical shape *and* naming a real calendar instant.
pub fn is_canonical(input: &str) -> bool {
	canonical_regex().is_match(input) &&
		NaiveDateTime::parse_from_str(input, CANONICAL_FORMAT).is_ok()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn formats_unix_seconds() {
		// 2021-01-01 00:00:00 UTC == 08:00:00 in Taipei.
		assert_eq!(canonical_from_unix(1609459200).unwrap(), "2021-01-01 08:00:00");
	}

	#[test]
	fn detects_milliseconds_by_magnitude() {
		assert_eq!(canonical_from_unix(1609459200000).unwrap(), "2021-01-01 08:00:00");
	}

	#[test]
	fn rejects_non_positive_values() {
		assert!(matches!(canonical_from_unix(0), Err(EngineError::InvalidTimeInput(_))));
		assert!(matches!(canonical_from_unix(-5), Err(EngineError::InvalidTimeInput(_))));
	}

	#[test]
	fn accepts_canonical_text_unchanged() {
		assert_eq!(canonical_from_text("2023-06-15 12:30:45").unwrap(), "2023-06-15 12:30:45");
	}

	#[test]
	fn converts_rfc3339_text() {
		assert_eq!(
			canonical_from_text("2021-01-01T00:00:00Z").unwrap(),
			"2021-01-01 08:00:00"
		);
	}

	#[test]
	fn rejects_garbage_text() {
		for bad in ["", "   ", "not a time", "2023/06/15 12:30:45"] {
			assert!(canonical_from_text(bad).is_err(), "{bad:?} should be rejected");
		}
	}

	#[test]
	fn validator_requires_exact_shape() {
		assert!(is_canonical("2023-06-15 12:30:45"));
		assert!(!is_canonical("2023-6-15 12:30:45"));
		assert!(!is_canonical("2023-06-15T12:30:45"));
		assert!(!is_canonical("2023-06-15 12:30:45.000"));
	}

	#[test]
	fn validator_rejects_impossible_dates() {
		assert!(!is_canonical("2023-02-30 12:00:00"));
		assert!(!is_canonical("2023-13-01 12:00:00"));
		assert!(!is_canonical("2023-06-15 24:00:00"));
	}

	#[test]
	fn leap_day_is_a_real_instant() {
		assert!(is_canonical("2024-02-29 00:00:00"));
		assert!(!is_canonical("2023-02-29 00:00:00"));
	}
}
