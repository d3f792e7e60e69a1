//! Fixed-point US dollar amounts.
//!
//! Amounts are held as an integer count of nano-dollars (1e-9 USD) so that
//! summing thousands of per-call costs never drifts the way `f64` does.

use std::{
    fmt,
    iter::Sum,
    ops::{Add, AddAssign},
    str::FromStr,
};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use ts_rs::TS;

pub const NANOS_PER_USD: i64 = 1_000_000_000;
const FRACTION_DIGITS: usize = 9;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UsdParseError {
    #[error("empty amount")]
    Empty,
    #[error("invalid amount: {0}")]
    Invalid(String),
    #[error("amount has more than 9 decimal places: {0}")]
    TooPrecise(String),
    #[error("amount out of range: {0}")]
    OutOfRange(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, TS)]
#[ts(type = "string")]
pub struct Usd(i64);

impl Usd {
    pub const ZERO: Usd = Usd(0);

    pub const fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    /// Whole-micro-dollar constructor, convenient for price tables
    /// (`Usd::from_micros(3_000_000)` is $3.00).
    pub const fn from_micros(micros: i64) -> Self {
        Self(micros * 1_000)
    }

    pub const fn nanos(self) -> i64 {
        self.0
    }

    pub fn saturating_add(self, other: Usd) -> Usd {
        Usd(self.0.saturating_add(other.0))
    }
}

impl Add for Usd {
    type Output = Usd;

    fn add(self, rhs: Usd) -> Usd {
        self.saturating_add(rhs)
    }
}

impl AddAssign for Usd {
    fn add_assign(&mut self, rhs: Usd) {
        *self = self.saturating_add(rhs);
    }
}

impl Sum for Usd {
    fn sum<I: Iterator<Item = Usd>>(iter: I) -> Self {
        iter.fold(Usd::ZERO, Add::add)
    }
}

impl fmt::Display for Usd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let whole = abs / NANOS_PER_USD as u64;
        let frac = abs % NANOS_PER_USD as u64;

        let mut frac_str = format!("{:0width$}", frac, width = FRACTION_DIGITS);
        while frac_str.len() > 2 && frac_str.ends_with('0') {
            frac_str.pop();
        }

        write!(f, "{sign}{whole}.{frac_str}")
    }
}

impl FromStr for Usd {
    type Err = UsdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(UsdParseError::Empty);
        }

        let (negative, digits) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s),
        };

        let (whole_str, frac_str) = digits.split_once('.').unwrap_or((digits, ""));
        if whole_str.is_empty() && frac_str.is_empty() {
            return Err(UsdParseError::Invalid(s.to_string()));
        }
        if !whole_str.chars().all(|c| c.is_ascii_digit())
            || !frac_str.chars().all(|c| c.is_ascii_digit())
        {
            return Err(UsdParseError::Invalid(s.to_string()));
        }
        if frac_str.len() > FRACTION_DIGITS {
            return Err(UsdParseError::TooPrecise(s.to_string()));
        }

        let whole: i64 = if whole_str.is_empty() {
            0
        } else {
            whole_str
                .parse()
                .map_err(|_| UsdParseError::OutOfRange(s.to_string()))?
        };
        let frac: i64 = if frac_str.is_empty() {
            0
        } else {
            format!("{:0<width$}", frac_str, width = FRACTION_DIGITS)
                .parse()
                .map_err(|_| UsdParseError::Invalid(s.to_string()))?
        };

        let nanos = whole
            .checked_mul(NANOS_PER_USD)
            .and_then(|w| w.checked_add(frac))
            .ok_or_else(|| UsdParseError::OutOfRange(s.to_string()))?;

        Ok(Usd(if negative { -nanos } else { nanos }))
    }
}

impl Serialize for Usd {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Usd {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
