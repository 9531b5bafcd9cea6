//! Duration strings.
//!
//! Timeout configuration accepts the compound duration format used across
//! the platform's tooling: a sequence of decimal values with unit suffixes,
//! e.g. "30s", "1m30s", "250ms".

use std::{fmt, str::FromStr, time::Duration};

/// A [`Duration`] parsed from a compound duration string. Used as a clap
/// value type for the timeout environment variables.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Timeout(pub Duration);

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub enum ParseError {
    #[error("invalid unit: {}", EXPECTED_UNITS)]
    InvalidUnit,

    #[error("missing a unit: {}", EXPECTED_UNITS)]
    NoUnit,

    #[error("invalid number: {0}")]
    NotANumber(#[from] std::num::ParseFloatError),

    #[error("durations must not be negative")]
    Negative,
}

const EXPECTED_UNITS: &str = "expected one of 'ns', 'us', 'ms', 's', 'm', or 'h'";

impl From<Timeout> for Duration {
    fn from(Timeout(duration): Timeout) -> Self {
        duration
    }
}

impl fmt::Display for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl FromStr for Timeout {
    type Err = ParseError;

    fn from_str(mut s: &str) -> Result<Self, Self::Err> {
        fn unit_base(unit: &str) -> Result<Duration, ParseError> {
            const MINUTE: Duration = Duration::from_secs(60);
            let base = match unit {
                "ns" => Duration::from_nanos(1),
                "us" | "\u{00b5}s" | "\u{03bc}s" => Duration::from_micros(1),
                "ms" => Duration::from_millis(1),
                "s" => Duration::from_secs(1),
                "m" => MINUTE,
                "h" => MINUTE * 60,
                _ => return Err(ParseError::InvalidUnit),
            };
            Ok(base)
        }

        if s.starts_with('-') {
            return Err(ParseError::Negative);
        }
        s = s.trim_start_matches('+');

        let mut total = Duration::ZERO;
        while !s.is_empty() {
            if let Some(unit_start) = s.find(|c: char| c.is_alphabetic()) {
                let (val, rest) = s.split_at(unit_start);
                let val = val.parse::<f64>()?;
                let unit = if let Some(next_numeric_start) =
                    rest.find(|c: char| !c.is_alphabetic())
                {
                    let (unit, rest) = rest.split_at(next_numeric_start);
                    s = rest;
                    unit
                } else {
                    s = "";
                    rest
                };
                total += unit_base(unit)?.mul_f64(val);
            } else if s == "0" {
                return Ok(Timeout(Duration::ZERO));
            } else {
                return Err(ParseError::NoUnit);
            }
        }

        Ok(Timeout(total))
    }
}
