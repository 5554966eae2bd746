//! Parsing of wall-clock timestamp text

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};

use crate::error::{IngestError, Result};

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

/// Parse a wall-clock value. A trailing UTC offset (`Z`, `+0100`, `-05:00`)
/// is discarded: the offset some exports attach is not trustworthy, so only
/// the wall clock is kept.
pub fn parse_naive(text: &str) -> Result<NaiveDateTime> {
    let wall_clock = strip_offset(text.trim());

    for format in NAIVE_FORMATS {
        if let Ok(value) = NaiveDateTime::parse_from_str(wall_clock, format) {
            return Ok(value);
        }
    }

    if let Ok(date) = NaiveDate::parse_from_str(wall_clock, "%Y-%m-%d") {
        return Ok(date.and_time(NaiveTime::MIN));
    }

    Err(IngestError::InvalidTimestamp(text.to_string()))
}

/// Parse an RFC 3339 instant; unlike [`parse_naive`] the offset is honoured
pub fn parse_instant(text: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| IngestError::InvalidTimestamp(text.to_string()))
}

fn strip_offset(text: &str) -> &str {
    if let Some(rest) = text.strip_suffix('Z') {
        return rest.trim_end();
    }

    // Offsets only ever follow the time part; the date itself contains '-'
    let Some(sign) = text.rfind(['+', '-']).filter(|&i| i > 10) else {
        return text;
    };
    let offset = &text[sign + 1..];
    let digits = offset.chars().filter(|c| c.is_ascii_digit()).count();
    let well_formed = offset.chars().all(|c| c.is_ascii_digit() || c == ':')
        && matches!((offset.len(), digits), (2, 2) | (4, 4) | (5, 4));

    if well_formed {
        text[..sign].trim_end()
    } else {
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, s)
            .unwrap()
    }

    #[test]
    fn test_parse_space_and_t_separated() {
        assert_eq!(parse_naive("2024-03-10 02:30:00").unwrap(), at(2024, 3, 10, 2, 30, 0));
        assert_eq!(parse_naive("2024-03-10T02:30:00").unwrap(), at(2024, 3, 10, 2, 30, 0));
        assert_eq!(parse_naive("2024-03-10 02:30").unwrap(), at(2024, 3, 10, 2, 30, 0));
    }

    #[test]
    fn test_parse_fractional_seconds() {
        let parsed = parse_naive("2024-03-10 02:30:00.250").unwrap();
        assert_eq!(parsed.and_utc().timestamp_subsec_millis(), 250);
    }

    #[test]
    fn test_offset_is_ignored() {
        let expected = at(2024, 1, 15, 8, 30, 0);
        assert_eq!(parse_naive("2024-01-15 08:30:00 -0800").unwrap(), expected);
        assert_eq!(parse_naive("2024-01-15T08:30:00+01:00").unwrap(), expected);
        assert_eq!(parse_naive("2024-01-15T08:30:00Z").unwrap(), expected);
    }

    #[test]
    fn test_bare_date_is_midnight() {
        assert_eq!(parse_naive("2024-01-15").unwrap(), at(2024, 1, 15, 0, 0, 0));
    }

    #[test]
    fn test_instant_applies_offset() {
        let expected = at(2024, 1, 15, 7, 30, 0).and_utc();
        assert_eq!(parse_instant("2024-01-15T08:30:00+01:00").unwrap(), expected);
        assert_eq!(parse_instant("2024-01-15T07:30:00Z").unwrap(), expected);
        assert!(matches!(
            parse_instant("2024-01-15 07:30"),
            Err(IngestError::InvalidTimestamp(_))
        ));
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(matches!(
            parse_naive("yesterday"),
            Err(IngestError::InvalidTimestamp(_))
        ));
    }
}
