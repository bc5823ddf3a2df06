//! KL-006: Duration strings for exec timeouts.
//!
//! Accepts a sequence of `<decimal><unit>` terms, e.g. `"10ms"`, `"1.5s"`,
//! `"1h30m"`. Units: `ns`, `us`/`µs`, `ms`, `s`, `m`, `h`. A bare `"0"` is zero.

use super::error::{Error, Result};
use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;

static TERM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+(?:\.\d*)?|\.\d+)(ns|us|µs|μs|ms|s|m|h)").expect("static regex")
});

fn unit_nanos(unit: &str) -> f64 {
    match unit {
        "ns" => 1.0,
        "us" | "µs" | "μs" => 1e3,
        "ms" => 1e6,
        "s" => 1e9,
        "m" => 60e9,
        _ => 3600e9,
    }
}

/// Parse a duration string. Negative durations are rejected.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let s = input.trim();
    let invalid = || Error::InvalidSpec(format!("invalid duration '{}'", input));

    let s = s.strip_prefix('+').unwrap_or(s);
    if s.starts_with('-') {
        return Err(Error::InvalidSpec(format!(
            "negative duration '{}' not allowed",
            input
        )));
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    if s.is_empty() {
        return Err(invalid());
    }

    let mut rest = s;
    let mut total_nanos = 0f64;
    while !rest.is_empty() {
        let caps = TERM.captures(rest).ok_or_else(invalid)?;
        let value: f64 = caps[1].parse().map_err(|_| invalid())?;
        total_nanos += value * unit_nanos(&caps[2]);
        rest = &rest[caps[0].len()..];
    }

    if !total_nanos.is_finite() || total_nanos > u64::MAX as f64 {
        return Err(invalid());
    }
    Ok(Duration::from_nanos(total_nanos.round() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_kl006_simple_units() {
        assert_eq!(parse_duration("10ms").unwrap(), Duration::from_millis(10));
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("3m").unwrap(), Duration::from_secs(180));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("250us").unwrap(), Duration::from_micros(250));
        assert_eq!(parse_duration("250µs").unwrap(), Duration::from_micros(250));
        assert_eq!(parse_duration("7ns").unwrap(), Duration::from_nanos(7));
    }

    #[test]
    fn test_kl006_compound_and_fractional() {
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration(".5s").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("1m0.25s").unwrap(), Duration::from_millis(60_250));
    }

    #[test]
    fn test_kl006_zero() {
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
        assert_eq!(parse_duration("0s").unwrap(), Duration::ZERO);
    }

    #[test]
    fn test_kl006_rejects_garbage() {
        for bad in ["", "10", "ms", "10 ms", "5d", "1h-3m", "abc"] {
            assert!(
                matches!(parse_duration(bad), Err(Error::InvalidSpec(_))),
                "expected rejection of {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_kl006_rejects_negative() {
        let err = parse_duration("-1s").unwrap_err();
        assert!(err.to_string().contains("negative"));
    }

    proptest! {
        #[test]
        fn prop_kl006_millis_roundtrip(ms in 0u64..10_000_000) {
            let parsed = parse_duration(&format!("{ms}ms")).unwrap();
            prop_assert_eq!(parsed, Duration::from_millis(ms));
        }

        #[test]
        fn prop_kl006_hours_minutes_sum(h in 0u64..100, m in 0u64..60) {
            let parsed = parse_duration(&format!("{h}h{m}m")).unwrap();
            prop_assert_eq!(parsed, Duration::from_secs(h * 3600 + m * 60));
        }
    }
}
