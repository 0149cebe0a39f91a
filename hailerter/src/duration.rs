//! CLI value parsing: durations and fractions
//! Durations are a plain integer number of seconds or an integer with an
//! `s`, `m` or `h` suffix, and must be positive. Fractions are reals in
//! [0.0, 1.0].

use crate::error::Error;

/// Parse `30`, `90s`, `5m`, `2h`. Zero and negatives are rejected.
pub fn parse_duration(input: &str) -> Result<i64, Error> {
    let input = input.trim();
    let (digits, multiplier) = match input.as_bytes().last() {
        Some(b's') => (&input[..input.len() - 1], 1),
        Some(b'm') => (&input[..input.len() - 1], 60),
        Some(b'h') => (&input[..input.len() - 1], 3600),
        _ => (input, 1),
    };
    let value: i64 = digits
        .parse()
        .map_err(|_| Error::InvalidDuration(input.to_string()))?;
    if value <= 0 {
        return Err(Error::InvalidDuration(input.to_string()));
    }
    Ok(value * multiplier)
}

/// Parse a real in [0.0, 1.0].
pub fn parse_fraction(input: &str) -> Result<f64, Error> {
    let value: f64 = input
        .trim()
        .parse()
        .map_err(|_| Error::InvalidFraction(input.to_string()))?;
    if !(0.0..=1.0).contains(&value) {
        return Err(Error::InvalidFraction(input.to_string()));
    }
    Ok(value)
}
