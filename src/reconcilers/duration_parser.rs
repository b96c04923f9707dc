use regex::Regex;
use std::{sync::OnceLock, time::Duration};

const NANOS_PER_DAY: u128 = 86_400 * 1_000_000_000;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty duration")]
    Empty,
    #[error("invalid duration '{0}'")]
    Invalid(String),
    #[error("duration '{0}' is out of range")]
    Overflow(String),
}

/// Parses durations such as `90s`, `1h30m`, `1.5h` or `2d12h`.
///
/// An optional leading `<N>d` adds whole days; the remainder follows the usual
/// `<number><unit>` sequence with units `ns`, `us`/`µs`, `ms`, `s`, `m`, `h`.
/// A bare `0` is accepted. Negative durations are rejected.
pub fn parse_duration(input: &str) -> Result<Duration, ParseError> {
    let s = input.trim();
    if s.is_empty() {
        return Err(ParseError::Empty);
    }

    static DAYS: OnceLock<Regex> = OnceLock::new();
    static COMPONENT: OnceLock<Regex> = OnceLock::new();
    let days_re = DAYS.get_or_init(|| Regex::new(r"^(\d+)d").unwrap());
    let component_re = COMPONENT
        .get_or_init(|| Regex::new(r"(\d+(?:\.\d*)?|\.\d+)(ns|us|µs|μs|ms|s|m|h)").unwrap());

    let invalid = || ParseError::Invalid(input.to_owned());
    let overflow = || ParseError::Overflow(input.to_owned());

    let (mut total_nanos, rest) = match days_re.captures(s) {
        Some(cap) => {
            let days: u128 = cap[1].parse().map_err(|_| overflow())?;
            let nanos = days.checked_mul(NANOS_PER_DAY).ok_or_else(overflow)?;
            (nanos, &s[cap[0].len()..])
        }
        None => (0u128, s),
    };

    if rest.is_empty() {
        // "3d" on its own is fine, but the days prefix must have matched
        return if s.len() > rest.len() {
            to_duration(total_nanos).ok_or_else(overflow)
        } else {
            Err(invalid())
        };
    }

    if rest == "0" {
        return to_duration(total_nanos).ok_or_else(overflow);
    }

    let mut consumed = 0;
    for cap in component_re.captures_iter(rest) {
        let Some(whole) = cap.get(0) else { continue };
        if whole.start() != consumed {
            return Err(invalid());
        }
        consumed = whole.end();

        let value: f64 = cap[1].parse().map_err(|_| invalid())?;
        let unit_nanos: f64 = match &cap[2] {
            "ns" => 1.0,
            "us" | "µs" | "μs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3_600e9,
            _ => return Err(invalid()),
        };

        let nanos = value * unit_nanos;
        if !nanos.is_finite() || nanos > u64::MAX as f64 {
            return Err(overflow());
        }
        total_nanos = total_nanos
            .checked_add(nanos.round() as u128)
            .ok_or_else(overflow)?;
    }

    if consumed != rest.len() {
        return Err(invalid());
    }

    to_duration(total_nanos).ok_or_else(overflow)
}

fn to_duration(nanos: u128) -> Option<Duration> {
    let secs = u64::try_from(nanos / 1_000_000_000).ok()?;
    Some(Duration::new(secs, (nanos % 1_000_000_000) as u32))
}

/// clap value parser wrapper
pub fn parse_duration_arg(input: &str) -> Result<Duration, String> {
    parse_duration(input).map_err(|e| e.to_string())
}
