//! Encoding of the 'grpc-timeout' request header: a decimal integer of at
//! most 8 digits followed by a single unit character.

use std::time::Duration;

/// Largest value encodable in the 8 digit field.
const MAX_TIMEOUT_VALUE: u128 = 99_999_999;

/// Unit ladder from smallest to largest: nanos, micros, millis, seconds,
/// minutes, hours.
const UNITS: [(char, u128); 6] = [
    ('n', 1),
    ('u', 1_000),
    ('m', 1_000_000),
    ('S', 1_000_000_000),
    ('M', 60 * 1_000_000_000),
    ('H', 3600 * 1_000_000_000),
];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum InvalidTimeout {
    #[error("empty grpc-timeout value")]
    Empty,

    #[error("grpc-timeout value has more than 8 digits")]
    TooManyDigits,

    #[error("malformed grpc-timeout value")]
    Malformed,

    #[error("unknown grpc-timeout unit: {0:?}")]
    UnknownUnit(char),
}

/// Encodes a timeout, greedily choosing the smallest unit whose value fits
/// in 8 digits. Values are truncated (never rounded up) so the decoded
/// timeout is always <= the original.
pub fn encode_timeout(timeout: Duration) -> String {
    let nanos = timeout.as_nanos();
    for (unit, unit_nanos) in UNITS {
        let value = nanos / unit_nanos;
        if value <= MAX_TIMEOUT_VALUE {
            return format!("{}{}", value, unit);
        }
    }

    // Beyond 99999999 hours. Clamp: nothing waits that long anyway.
    format!("{}H", MAX_TIMEOUT_VALUE)
}

pub fn decode_timeout(value: &str) -> Result<Duration, InvalidTimeout> {
    if value.is_empty() {
        return Err(InvalidTimeout::Empty);
    }
    if !value.is_ascii() {
        return Err(InvalidTimeout::Malformed);
    }

    let (digits, unit) = value.split_at(value.len() - 1);
    let unit = unit.chars().next().ok_or(InvalidTimeout::Malformed)?;

    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(InvalidTimeout::Malformed);
    }
    if digits.len() > 8 {
        return Err(InvalidTimeout::TooManyDigits);
    }

    let amount: u64 = digits.parse().map_err(|_| InvalidTimeout::Malformed)?;

    let unit_nanos = UNITS
        .iter()
        .find(|(u, _)| *u == unit)
        .map(|(_, n)| *n)
        .ok_or(InvalidTimeout::UnknownUnit(unit))?;

    Ok(Duration::from_nanos(
        (amount as u128 * unit_nanos).min(u64::MAX as u128) as u64,
    ))
}
