use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};

/// Layout of the Unix `date` wall-clock string, always rendered in UTC
pub const UNIX_DATE_LAYOUT: &str = "%a %b %e %H:%M:%S UTC %Y";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("expected 6 fields in timestamp '{0}'")]
    WrongFieldCount(String),
    #[error("unknown month '{0}'")]
    UnknownMonth(String),
    #[error("unknown time zone '{0}'")]
    UnknownZone(String),
    #[error("invalid date or time in '{0}'")]
    OutOfRange(String),
}

pub fn format(t: DateTime<Utc>) -> String {
    t.format(UNIX_DATE_LAYOUT).to_string()
}

/// Parses "Mon Jan _2 15:04:05 MST 2006". The weekday is not checked against the date.
pub fn parse(s: &str) -> Result<DateTime<Utc>, ParseError> {
    let fields: Vec<&str> = s.split_whitespace().collect();
    let [_weekday, month, day, clock, zone, year] = fields.as_slice() else {
        return Err(ParseError::WrongFieldCount(s.to_owned()));
    };

    let month = month_number(month).ok_or_else(|| ParseError::UnknownMonth(month.to_string()))?;
    let offset = zone_offset_hours(zone).ok_or_else(|| ParseError::UnknownZone(zone.to_string()))?;

    let out_of_range = || ParseError::OutOfRange(s.to_owned());
    let day: u32 = day.parse().map_err(|_| out_of_range())?;
    let year: i32 = year.parse().map_err(|_| out_of_range())?;

    let mut hms = clock.split(':').map(|p| p.parse::<u32>());
    let (Some(Ok(h)), Some(Ok(m)), Some(Ok(sec)), None) = (hms.next(), hms.next(), hms.next(), hms.next())
    else {
        return Err(out_of_range());
    };

    let date = NaiveDate::from_ymd_opt(year, month, day).ok_or_else(out_of_range)?;
    let time = NaiveTime::from_hms_opt(h, m, sec).ok_or_else(out_of_range)?;

    date.and_time(time)
        .and_utc()
        .checked_sub_signed(Duration::hours(offset))
        .ok_or_else(out_of_range)
}

/// Saturates instead of failing on durations chrono cannot hold
pub fn to_chrono(d: std::time::Duration) -> Duration {
    Duration::from_std(d).unwrap_or(Duration::MAX)
}

/// `t + d`, or `None` past the last representable instant
pub fn checked_after(t: DateTime<Utc>, d: std::time::Duration) -> Option<DateTime<Utc>> {
    t.checked_add_signed(to_chrono(d))
}

/// `t + d`, pinned to the last representable instant
pub fn saturating_after(t: DateTime<Utc>, d: std::time::Duration) -> DateTime<Utc> {
    checked_after(t, d).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Parses an optional timestamp field; empty strings mean "unset"
pub fn parse_opt(s: &str) -> Result<Option<DateTime<Utc>>, ParseError> {
    if s.trim().is_empty() {
        Ok(None)
    } else {
        parse(s).map(Some)
    }
}

fn month_number(month: &str) -> Option<u32> {
    const MONTHS: [&str; 12] = [
        "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
    ];
    MONTHS
        .iter()
        .position(|m| m.eq_ignore_ascii_case(month))
        .map(|i| i as u32 + 1)
}

fn zone_offset_hours(zone: &str) -> Option<i64> {
    let offset = match zone {
        "UTC" | "GMT" | "Z" => 0,
        "EST" => -5,
        "EDT" => -4,
        "CST" => -6,
        "CDT" => -5,
        "MST" => -7,
        "MDT" => -6,
        "PST" => -8,
        "PDT" => -7,
        "CET" => 1,
        "CEST" => 2,
        _ => return None,
    };
    Some(offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn formats_with_space_padded_day() {
        let t = Utc.with_ymd_and_hms(2006, 1, 2, 15, 4, 5).unwrap();
        assert_eq!(format(t), "Mon Jan  2 15:04:05 UTC 2006");
    }

    #[test]
    fn parses_what_it_formats() {
        let t = Utc.with_ymd_and_hms(2024, 11, 23, 8, 0, 59).unwrap();
        assert_eq!(parse(&format(t)).unwrap(), t);
    }

    #[test]
    fn applies_zone_offsets() {
        let t = parse("Mon Jan 2 15:04:05 MST 2006").unwrap();
        assert_eq!(t, Utc.with_ymd_and_hms(2006, 1, 2, 22, 4, 5).unwrap());
    }

    #[test]
    fn far_future_arithmetic_does_not_overflow() {
        let last = parse("Fri Dec 31 23:59:59 UTC 262142").unwrap();
        assert_eq!(checked_after(last, std::time::Duration::from_secs(3 * 3600)), None);
        assert_eq!(
            saturating_after(last, std::time::Duration::from_secs(60)),
            DateTime::<Utc>::MAX_UTC
        );
        assert!(matches!(
            parse("Fri Dec 31 23:59:59 EST 262142"),
            Err(ParseError::OutOfRange(_))
        ));
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(parse("yesterday"), Err(ParseError::WrongFieldCount(_))));
        assert!(matches!(
            parse("Mon Foo 2 15:04:05 UTC 2006"),
            Err(ParseError::UnknownMonth(_))
        ));
        assert!(matches!(
            parse("Mon Jan 2 15:04:05 XYZ 2006"),
            Err(ParseError::UnknownZone(_))
        ));
        assert!(matches!(
            parse("Mon Feb 31 15:04:05 UTC 2006"),
            Err(ParseError::OutOfRange(_))
        ));
        assert!(matches!(
            parse("Mon Jan 2 15:04 UTC 2006"),
            Err(ParseError::OutOfRange(_))
        ));
    }

    #[test]
    fn empty_is_unset() {
        assert_eq!(parse_opt("  ").unwrap(), None);
    }
}
