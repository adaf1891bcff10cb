//! Conversion of scheduler attribute values into typed quantities.

use std::time::Duration;

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};

use crate::error::UnitError;

/// Date format the scheduler prints for `ctime`, `qtime`, etc.
/// (e.g. `Mon Jul 24 10:33:11 2017`), interpreted in local time.
pub const SCHEDULER_DATE_FORMAT: &str = "%a %b %e %H:%M:%S %Y";

const SIZE_PREFIXES: &str = "kmgtpe";
const WORD_BYTES: u64 = 8;

/// Parse a size such as `4gb`, `512mb`, `1024kb`, `100` or `2mw` into bytes.
///
/// Prefixes scale by powers of 1024. A trailing `b` (or nothing) means bytes,
/// a trailing `w` means 8-byte words.
pub fn parse_size(value: &str) -> Result<u64, UnitError> {
    let err = || UnitError::InvalidSize(value.to_string());
    let s = value.trim().to_ascii_lowercase();

    let digits_end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    if digits_end == 0 {
        return Err(err());
    }
    let magnitude: u64 = s[..digits_end].parse().map_err(|_| err())?;

    let mut rest = &s[digits_end..];
    let mut exponent = 0u32;
    if let Some(pos) = rest.chars().next().and_then(|c| SIZE_PREFIXES.find(c)) {
        exponent = pos as u32 + 1;
        rest = &rest[1..];
    }

    let unit = match rest {
        "" | "b" => 1,
        "w" => WORD_BYTES,
        _ => return Err(err()),
    };

    magnitude
        .checked_mul(1024u64.pow(exponent))
        .and_then(|bytes| bytes.checked_mul(unit))
        .ok_or_else(err)
}

/// Parse a `[[[days:]hours:]minutes:]seconds` duration.
///
/// Fields are right-aligned, so `90` is 90 seconds and `1:30` is 90 seconds
/// too. Each field may be fractional.
pub fn parse_duration(value: &str) -> Result<Duration, UnitError> {
    const SCALE: [f64; 4] = [1.0, 60.0, 3600.0, 86400.0];
    let err = || UnitError::InvalidDuration(value.to_string());

    let fields: Vec<&str> = value.trim().split(':').collect();
    if fields.len() > SCALE.len() {
        return Err(err());
    }

    let mut total = 0.0;
    for (field, scale) in fields.iter().rev().zip(SCALE) {
        let n: f64 = field.trim().parse().map_err(|_| err())?;
        if !n.is_finite() || n < 0.0 {
            return Err(err());
        }
        total += n * scale;
    }
    Duration::try_from_secs_f64(total).map_err(|_| err())
}

/// Parse a timestamp given as epoch seconds or in [`SCHEDULER_DATE_FORMAT`].
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, UnitError> {
    let err = || UnitError::InvalidTimestamp(value.to_string());
    let trimmed = value.trim();

    if let Ok(secs) = trimmed.parse::<i64>() {
        return DateTime::from_timestamp(secs, 0).ok_or_else(err);
    }

    let naive = NaiveDateTime::parse_from_str(trimmed, SCHEDULER_DATE_FORMAT).map_err(|_| err())?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
        .ok_or_else(err)
}

/// Parse a signed integer.
pub fn parse_integer(value: &str) -> Result<i64, UnitError> {
    value
        .trim()
        .parse()
        .map_err(|_| UnitError::InvalidInteger(value.to_string()))
}

/// Interpret a scheduler boolean. Anything but an explicit false value is true.
pub fn parse_flag(value: &str) -> bool {
    !matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "" | "0" | "false" | "f" | "no" | "n"
    )
}
