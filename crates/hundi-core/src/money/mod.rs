//! Fixed-point money arithmetic for the commission ledger.
//!
//! All monetary values are carried as signed 64-bit **minor units**
//! (cents / paise, 2 decimal places) and all commission rates as
//! **basis points** (1 bps = 0.01%). Percentage application uses
//! round-half-even at the minor-unit boundary via an i128 intermediate,
//! so results are deterministic across platforms and reproducible for
//! audit: `sum(commissions) <= amount` holds whenever the rates sum to
//! at most 100%.
//!
//! No floating point is used anywhere in this module.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Basis points in one whole (100%).
pub const BPS_PER_WHOLE: u32 = 10_000;

/// Minor units per major currency unit (2 decimal places).
pub const MINOR_PER_MAJOR: i64 = 100;

/// Errors from parsing or combining monetary values.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum MoneyError {
    /// The textual amount could not be parsed.
    #[error("invalid amount {input:?}: {reason}")]
    InvalidAmount {
        /// The offending input.
        input: String,
        /// What was wrong with it.
        reason: &'static str,
    },

    /// A rate was outside the 0%..=100% range.
    #[error("rate out of range: {bps} bps (max {max} bps)", max = BPS_PER_WHOLE)]
    RateOutOfRange {
        /// The offending value in basis points.
        bps: u32,
    },

    /// Arithmetic overflowed the i64 minor-unit range.
    #[error("amount overflow")]
    Overflow,
}

/// A monetary amount in minor units (2 decimal places).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Money(i64);

impl Money {
    /// Zero amount.
    pub const ZERO: Self = Self(0);

    /// Creates an amount from minor units (e.g. `1050` is `10.50`).
    #[must_use]
    pub const fn from_minor(minor: i64) -> Self {
        Self(minor)
    }

    /// Creates an amount from whole major units (e.g. `100` is `100.00`).
    ///
    /// Saturates at the i64 boundary; callers dealing with untrusted
    /// magnitudes should parse via [`FromStr`] instead.
    #[must_use]
    pub const fn from_major(major: i64) -> Self {
        Self(major.saturating_mul(MINOR_PER_MAJOR))
    }

    /// The raw minor-unit value.
    #[must_use]
    pub const fn minor(self) -> i64 {
        self.0
    }

    /// Whether the amount is strictly negative.
    #[must_use]
    pub const fn is_negative(self) -> bool {
        self.0 < 0
    }

    /// Checked addition.
    ///
    /// # Errors
    ///
    /// Returns [`MoneyError::Overflow`] if the sum leaves the i64 range.
    pub fn checked_add(self, other: Self) -> Result<Self, MoneyError> {
        self.0
            .checked_add(other.0)
            .map(Self)
            .ok_or(MoneyError::Overflow)
    }

    /// Checked subtraction.
    ///
    /// # Errors
    ///
    /// Returns [`MoneyError::Overflow`] if the difference leaves the i64
    /// range.
    pub fn checked_sub(self, other: Self) -> Result<Self, MoneyError> {
        self.0
            .checked_sub(other.0)
            .map(Self)
            .ok_or(MoneyError::Overflow)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(
            f,
            "{sign}{}.{:02}",
            abs / MINOR_PER_MAJOR as u64,
            abs % MINOR_PER_MAJOR as u64
        )
    }
}

impl FromStr for Money {
    type Err = MoneyError;

    /// Parses `"123"`, `"123.4"`, `"123.45"`, with an optional leading
    /// `-`. More than 2 fractional digits is rejected rather than
    /// silently truncated.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason| MoneyError::InvalidAmount {
            input: s.to_string(),
            reason,
        };

        let (negative, body) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s),
        };

        let (whole, frac) = match body.split_once('.') {
            Some((w, f)) => (w, f),
            None => (body, ""),
        };

        if whole.is_empty() && frac.is_empty() {
            return Err(invalid("empty amount"));
        }
        if frac.len() > 2 {
            return Err(invalid("more than 2 decimal places"));
        }
        if !whole.chars().all(|c| c.is_ascii_digit())
            || !frac.chars().all(|c| c.is_ascii_digit())
        {
            return Err(invalid("non-digit character"));
        }

        let whole: i64 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| invalid("whole part too large"))?
        };
        // "4" after the point means 40 minor units, "45" means 45.
        let mut frac_minor: i64 = if frac.is_empty() {
            0
        } else {
            frac.parse().map_err(|_| invalid("bad fraction"))?
        };
        if frac.len() == 1 {
            frac_minor *= 10;
        }

        let minor = whole
            .checked_mul(MINOR_PER_MAJOR)
            .and_then(|m| m.checked_add(frac_minor))
            .ok_or(MoneyError::Overflow)?;

        Ok(Self(if negative { -minor } else { minor }))
    }
}

/// A commission rate in basis points (0..=10000, i.e. 0%..=100%).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Rate(u16);

impl Rate {
    /// The zero rate.
    pub const ZERO: Self = Self(0);

    /// Creates a rate from basis points.
    ///
    /// # Errors
    ///
    /// Returns [`MoneyError::RateOutOfRange`] for values above 100%.
    pub fn from_bps(bps: u32) -> Result<Self, MoneyError> {
        if bps > BPS_PER_WHOLE {
            return Err(MoneyError::RateOutOfRange { bps });
        }
        Ok(Self(bps as u16))
    }

    /// The rate in basis points.
    #[must_use]
    pub const fn bps(self) -> u32 {
        self.0 as u32
    }

    /// Applies this rate to an amount: `amount * bps / 10_000`, rounded
    /// half-even at the minor-unit boundary.
    ///
    /// The computation runs in i128, so it cannot overflow for any i64
    /// amount, and the sign of the result follows the sign of the
    /// amount. Callers that must reject negative amounts do so before
    /// calling (see the calculator).
    #[must_use]
    pub fn commission_on(self, amount: Money) -> Money {
        let negative = amount.minor() < 0;
        let numerator = i128::from(amount.minor().unsigned_abs()) * i128::from(self.0);
        let divisor = i128::from(BPS_PER_WHOLE);

        let quotient = numerator / divisor;
        let remainder = numerator % divisor;

        // Half-even: round up when the remainder is past the midpoint,
        // and at the exact midpoint only when the quotient is odd.
        let rounded = match (remainder * 2).cmp(&divisor) {
            std::cmp::Ordering::Greater => quotient + 1,
            std::cmp::Ordering::Equal if quotient % 2 != 0 => quotient + 1,
            _ => quotient,
        };

        // rounded <= |amount| <= i64::MAX, so the cast is lossless.
        let minor = rounded as i64;
        Money::from_minor(if negative { -minor } else { minor })
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.0 / 100;
        let frac = self.0 % 100;
        if frac == 0 {
            write!(f, "{whole}%")
        } else if frac % 10 == 0 {
            write!(f, "{whole}.{}%", frac / 10)
        } else {
            write!(f, "{whole}.{frac:02}%")
        }
    }
}

impl FromStr for Rate {
    type Err = MoneyError;

    /// Parses a percentage such as `"3"`, `"0.5"`, or `"12.75"` into
    /// basis points.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || MoneyError::InvalidAmount {
            input: s.to_string(),
            reason: "invalid percentage",
        };

        let (whole, frac) = match s.split_once('.') {
            Some((w, f)) => (w, f),
            None => (s, ""),
        };
        if (whole.is_empty() && frac.is_empty()) || frac.len() > 2 {
            return Err(invalid());
        }
        if !whole.chars().all(|c| c.is_ascii_digit())
            || !frac.chars().all(|c| c.is_ascii_digit())
        {
            return Err(invalid());
        }

        let whole: u32 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| invalid())?
        };
        let mut frac_bps: u32 = if frac.is_empty() {
            0
        } else {
            frac.parse().map_err(|_| invalid())?
        };
        if frac.len() == 1 {
            frac_bps *= 10;
        }

        let bps = whole
            .checked_mul(100)
            .and_then(|b| b.checked_add(frac_bps))
            .ok_or_else(invalid)?;
        Self::from_bps(bps)
    }
}
