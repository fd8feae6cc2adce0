//! Fixed-point decimal used by the numeric task adapters. Values are kept as
//! an `i128` mantissa and a base-10 scale, which covers price feeds and the
//! `times` multipliers jobs use without float rounding.

use anyhow::{anyhow, bail, Context, Result};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

const MAX_SCALE: u32 = 36;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decimal {
    mantissa: i128,
    scale: u32,
}

impl Decimal {
    pub fn from_integer(value: i128) -> Self {
        Self {
            mantissa: value,
            scale: 0,
        }
    }

    /// Accepts JSON numbers and numeric strings.
    pub fn from_json(value: &Value) -> Result<Self> {
        match value {
            Value::Number(number) => number.to_string().parse(),
            Value::String(text) => text.parse(),
            other => bail!("expected a number, got {other}"),
        }
    }

    pub fn is_negative(&self) -> bool {
        self.mantissa < 0
    }

    pub fn checked_mul(&self, other: &Decimal) -> Option<Decimal> {
        let mantissa = self.mantissa.checked_mul(other.mantissa)?;
        let scale = self.scale.checked_add(other.scale)?;
        Some(Decimal { mantissa, scale }.normalized())
    }

    /// Integer part, rounding toward zero.
    pub fn trunc(&self) -> i128 {
        // scale is bounded by MAX_SCALE after normalization, so the power fits.
        self.mantissa / 10i128.pow(self.scale.min(MAX_SCALE))
    }

    /// Relative change from `self` to `next`, in percent.
    pub fn percent_change_to(&self, next: &Decimal) -> f64 {
        let current = self.to_f64();
        if current == 0.0 {
            return if next.to_f64() == 0.0 { 0.0 } else { f64::INFINITY };
        }
        ((next.to_f64() - current) / current).abs() * 100.0
    }

    pub fn to_f64(&self) -> f64 {
        self.mantissa as f64 / 10f64.powi(self.scale as i32)
    }

    fn normalized(mut self) -> Self {
        while self.scale > 0 && self.mantissa % 10 == 0 {
            self.mantissa /= 10;
            self.scale -= 1;
        }
        while self.scale > MAX_SCALE {
            self.mantissa /= 10;
            self.scale -= 1;
        }
        self
    }
}

impl FromStr for Decimal {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        let text = raw.trim();
        let (number, exponent) = match text.find(['e', 'E']) {
            Some(idx) => (
                &text[..idx],
                text[idx + 1..]
                    .parse::<i32>()
                    .with_context(|| format!("invalid exponent in {raw:?}"))?,
            ),
            None => (text, 0),
        };

        let (negative, digits) = match number.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, number.strip_prefix('+').unwrap_or(number)),
        };
        let (whole, fraction) = digits.split_once('.').unwrap_or((digits, ""));
        if whole.is_empty() && fraction.is_empty() {
            bail!("{raw:?} is not a decimal number");
        }
        if !whole.chars().chain(fraction.chars()).all(|c| c.is_ascii_digit()) {
            bail!("{raw:?} is not a decimal number");
        }

        let mut mantissa: i128 = 0;
        for digit in whole.chars().chain(fraction.chars()) {
            mantissa = mantissa
                .checked_mul(10)
                .and_then(|value| value.checked_add(i128::from(digit as u8 - b'0')))
                .ok_or_else(|| anyhow!("{raw:?} overflows the supported precision"))?;
        }

        let mut scale = fraction.len() as i64 - i64::from(exponent);
        while scale < 0 {
            mantissa = mantissa
                .checked_mul(10)
                .ok_or_else(|| anyhow!("{raw:?} overflows the supported precision"))?;
            scale += 1;
        }
        if negative {
            mantissa = -mantissa;
        }

        let scale = u32::try_from(scale).map_err(|_| anyhow!("{raw:?} has too many decimals"))?;
        Ok(Decimal { mantissa, scale }.normalized())
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.scale == 0 {
            return write!(f, "{}", self.mantissa);
        }
        let sign = if self.mantissa < 0 { "-" } else { "" };
        let digits = self.mantissa.unsigned_abs().to_string();
        let scale = self.scale as usize;
        let padded = format!("{digits:0>width$}", width = scale + 1);
        let (whole, fraction) = padded.split_at(padded.len() - scale);
        write!(f, "{sign}{whole}.{fraction}")
    }
}

impl Serialize for Decimal {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Decimal {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Decimal::from_json(&value).map_err(de::Error::custom)
    }
}
