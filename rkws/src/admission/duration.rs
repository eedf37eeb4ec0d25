// Parsing of timeout values written as compact durations:
// "30m", "1h30m", "1.5h", "300ms", "-5m", "0"
//
// Accepted units are ns, us (µs), ms, s, m and h. Every number needs a
// unit except a bare "0". The total must fit in i64 nanoseconds.

use chrono::TimeDelta;

const NANOS_PER_UNIT: [(&str, u128); 8] = [
    ("ns", 1),
    ("us", 1_000),
    ("µs", 1_000),
    ("μs", 1_000),
    ("ms", 1_000_000),
    ("s", 1_000_000_000),
    ("m", 60 * 1_000_000_000),
    ("h", 3600 * 1_000_000_000),
];

// fraction digits past this precision cannot change the result
const MAX_FRACTION_DIGITS: usize = 20;

/// Parse a duration string such as `"1h30m"`.
///
/// # Examples
/// ```
/// # use chrono::TimeDelta;
/// # use rkws::admission::parse_duration;
/// assert_eq!(parse_duration("1h30m").unwrap(), TimeDelta::minutes(90));
/// assert_eq!(parse_duration("1.5s").unwrap(), TimeDelta::milliseconds(1500));
/// assert_eq!(parse_duration("-5m").unwrap(), TimeDelta::minutes(-5));
/// assert!(parse_duration("soon").is_err());
/// ```
pub fn parse_duration(s: &str) -> Result<TimeDelta, String> {
    let (negative, mut rest) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    if rest == "0" {
        return Ok(TimeDelta::zero());
    }
    if rest.is_empty() {
        return Err(format!("Invalid duration: '{}'", s));
    }

    let mut total: u128 = 0;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let (number, tail) = rest.split_at(number_len);

        let unit_len = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_len);
        let scale = unit_nanos(unit).ok_or_else(|| {
            if unit.is_empty() {
                format!("Missing unit in duration: '{}'", s)
            } else {
                format!("Unknown unit '{}' in duration: '{}'", unit, s)
            }
        })?;

        let nanos = component_nanos(number, scale)
            .ok_or_else(|| format!("Invalid numeric value in duration: '{}'", s))?;
        total = total
            .checked_add(nanos)
            .filter(|t| *t <= i64::MAX as u128)
            .ok_or_else(|| format!("Duration out of range: '{}'", s))?;
        rest = tail;
    }

    if total > i64::MAX as u128 {
        return Err(format!("Duration out of range: '{}'", s));
    }
    let nanos = total as i64;
    Ok(TimeDelta::nanoseconds(if negative { -nanos } else { nanos }))
}

// Nanoseconds of `number` (digits with at most one '.') in units of `scale`.
// `None` for malformed numbers; out-of-range values saturate so the caller
// reports them as such.
fn component_nanos(number: &str, scale: u128) -> Option<u128> {
    let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
    if whole.is_empty() && fraction.is_empty() || fraction.contains('.') {
        return None;
    }

    let whole = if whole.is_empty() {
        0
    } else {
        whole.parse::<u128>().unwrap_or(u128::MAX)
    };

    let mut numerator: u128 = 0;
    let mut denominator: u128 = 1;
    for digit in fraction.bytes().take(MAX_FRACTION_DIGITS) {
        numerator = numerator * 10 + u128::from(digit - b'0');
        denominator *= 10;
    }

    let whole_nanos = whole.saturating_mul(scale);
    Some(whole_nanos.saturating_add(numerator * scale / denominator))
}

fn unit_nanos(unit: &str) -> Option<u128> {
    NANOS_PER_UNIT
        .iter()
        .find(|(name, _)| *name == unit)
        .map(|(_, nanos)| *nanos)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_units() {
        assert_eq!(parse_duration("300ms").unwrap(), TimeDelta::milliseconds(300));
        assert_eq!(parse_duration("30m").unwrap(), TimeDelta::minutes(30));
        assert_eq!(parse_duration("2h").unwrap(), TimeDelta::hours(2));
        assert_eq!(parse_duration("15us").unwrap(), TimeDelta::microseconds(15));
        assert_eq!(parse_duration("15µs").unwrap(), TimeDelta::microseconds(15));
        assert_eq!(parse_duration("7ns").unwrap(), TimeDelta::nanoseconds(7));
    }

    #[test]
    fn parses_compound_and_fractional_values() {
        assert_eq!(parse_duration("1h30m").unwrap(), TimeDelta::minutes(90));
        assert_eq!(parse_duration("1.5h").unwrap(), TimeDelta::minutes(90));
        assert_eq!(
            parse_duration("2h45m30.5s").unwrap(),
            TimeDelta::milliseconds((2 * 3600 + 45 * 60 + 30) * 1000 + 500)
        );
        assert_eq!(parse_duration(".5s").unwrap(), TimeDelta::milliseconds(500));
        assert_eq!(parse_duration("1.s").unwrap(), TimeDelta::seconds(1));
        assert_eq!(parse_duration("+10s").unwrap(), TimeDelta::seconds(10));
    }

    #[test]
    fn negative_durations_are_valid() {
        assert_eq!(parse_duration("-5m").unwrap(), TimeDelta::minutes(-5));
        assert_eq!(parse_duration("-1h30m").unwrap(), TimeDelta::minutes(-90));
        assert_eq!(parse_duration("-0").unwrap(), TimeDelta::zero());
    }

    #[test]
    fn zero_needs_no_unit() {
        assert_eq!(parse_duration("0").unwrap(), TimeDelta::zero());
        assert_eq!(parse_duration("0s").unwrap(), TimeDelta::zero());
    }

    #[test]
    fn total_must_fit_in_i64_nanoseconds() {
        assert_eq!(
            parse_duration("2562047h").unwrap(),
            TimeDelta::hours(2_562_047)
        );
        assert_eq!(
            parse_duration("9223372036854775807ns").unwrap(),
            TimeDelta::nanoseconds(i64::MAX)
        );
        for input in [
            "3000000h",
            "2562048h",
            "-3000000h",
            "9223372036854775808ns",
            "2562047h48m",
            "99999999999999999999999999999999999999999h",
        ] {
            let err = parse_duration(input).unwrap_err();
            assert!(err.contains("out of range"), "{input:?}: {err}");
        }
    }

    #[test]
    fn rejects_malformed_values() {
        for input in [
            "", "-", "not-a-duration", "10", "h", "1.2.3s", "5d", "1h 30m", ".s", "+", "--5m",
        ] {
            assert!(parse_duration(input).is_err(), "accepted {input:?}");
        }
    }
}
