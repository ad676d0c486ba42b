//! Value guards shared by the order book and candle paths.
//!
//! Ledger payloads mix JSON numbers and numeric strings, and strings may use
//! scientific notation (`"1.5e-7"`). Everything numeric that enters the engine
//! goes through [`WireNumber::to_f64`] or [`parse_decimal`], and every candle
//! price goes through [`is_within_bounds`].

use crate::error::AppError;
use serde::{Deserialize, Serialize};

/// Exclusive lower bound for any candle price. Feeds use `0` and tiny
/// denormals as "no trade" sentinels.
pub const MIN_BOUND: f64 = 1e-12;
/// Exclusive upper bound for any candle price. Feeds use values near the
/// largest safe integer as overflow sentinels.
pub const MAX_BOUND: f64 = 9.0071992547409e13;

const MAX_EXPONENT_MAGNITUDE: i32 = 400;

/// A numeric field that may arrive either as a JSON number or a string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireNumber {
    Number(f64),
    Text(String),
}

impl WireNumber {
    pub fn to_f64(&self) -> Result<f64, AppError> {
        match self {
            Self::Number(value) if value.is_finite() => Ok(*value),
            Self::Number(value) => Err(AppError::MalformedData(format!(
                "non-finite numeric value {value}"
            ))),
            Self::Text(text) => parse_decimal(text),
        }
    }
}

impl From<f64> for WireNumber {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for WireNumber {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

pub fn is_within_bounds(value: f64) -> bool {
    value.is_finite() && value > MIN_BOUND && value < MAX_BOUND
}

/// Parses a decimal string that may be written in scientific notation.
pub fn parse_decimal(text: &str) -> Result<f64, AppError> {
    let normalized = normalize_scientific(text)?;
    let value = normalized.parse::<f64>()?;
    if !value.is_finite() {
        return Err(AppError::MalformedData(format!(
            "decimal '{text}' is out of range"
        )));
    }
    Ok(value)
}

/// Rewrites `"1.5e-7"` style input as a plain decimal string (`"0.00000015"`).
///
/// Plain decimals are returned canonicalised: no leading `+`, no redundant
/// leading zeros in the integer part and no trailing zeros in the fraction.
pub fn normalize_scientific(text: &str) -> Result<String, AppError> {
    let trimmed = text.trim();
    let malformed = || AppError::MalformedData(format!("'{text}' is not a decimal number"));

    let (negative, unsigned) = match trimmed.as_bytes().first() {
        Some(b'-') => (true, &trimmed[1..]),
        Some(b'+') => (false, &trimmed[1..]),
        Some(_) => (false, trimmed),
        None => return Err(malformed()),
    };

    let (mantissa, exponent) = match unsigned.find(['e', 'E']) {
        Some(index) => {
            let exponent = unsigned[index + 1..]
                .parse::<i32>()
                .map_err(|_| malformed())?;
            (&unsigned[..index], exponent)
        }
        None => (unsigned, 0),
    };
    if exponent.abs() > MAX_EXPONENT_MAGNITUDE {
        return Err(malformed());
    }

    let (integer_part, fraction_part) = match mantissa.split_once('.') {
        Some((integer, fraction)) => (integer, fraction),
        None => (mantissa, ""),
    };
    if integer_part.is_empty() && fraction_part.is_empty() {
        return Err(malformed());
    }
    if !integer_part.bytes().all(|byte| byte.is_ascii_digit())
        || !fraction_part.bytes().all(|byte| byte.is_ascii_digit())
    {
        return Err(malformed());
    }

    let digits = format!("{integer_part}{fraction_part}");
    let point = integer_part.len() as i64 + i64::from(exponent);

    let (whole, fraction) = if point <= 0 {
        let zeros = "0".repeat(point.unsigned_abs() as usize);
        (String::from("0"), format!("{zeros}{digits}"))
    } else if point as usize >= digits.len() {
        let zeros = "0".repeat(point as usize - digits.len());
        (format!("{digits}{zeros}"), String::new())
    } else {
        let (whole, fraction) = digits.split_at(point as usize);
        (whole.to_string(), fraction.to_string())
    };

    let whole = whole.trim_start_matches('0');
    let whole = if whole.is_empty() { "0" } else { whole };
    let fraction = fraction.trim_end_matches('0');

    let mut normalized = String::with_capacity(whole.len() + fraction.len() + 2);
    let is_zero = whole == "0" && fraction.is_empty();
    if negative && !is_zero {
        normalized.push('-');
    }
    normalized.push_str(whole);
    if !fraction.is_empty() {
        normalized.push('.');
        normalized.push_str(fraction);
    }
    Ok(normalized)
}
