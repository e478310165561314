//! Conversions between on-chain base units (`U256`), human token units
//! (`Decimal`) and the `NUMERIC(78,0)` columns the stores use.

use std::str::FromStr;

use alloy_primitives::U256;
use rust_decimal::Decimal;
use sqlx::types::BigDecimal;

use crate::error::LedgerError;

fn pow10(exp: u32) -> U256 {
    U256::from(10u64).pow(U256::from(exp))
}

/// `parseUnits`: whole-token decimal amount into base units, truncating any
/// precision finer than `decimals`. Negative amounts map to zero.
pub fn to_base_units(amount: Decimal, decimals: u8) -> U256 {
    if amount.is_sign_negative() {
        return U256::ZERO;
    }
    let mantissa = U256::from(amount.mantissa().unsigned_abs());
    let scale = amount.scale();
    let decimals = decimals as u32;

    if decimals >= scale {
        mantissa.saturating_mul(pow10(decimals - scale))
    } else {
        mantissa / pow10(scale - decimals)
    }
}

/// Rescale an amount between two token precisions (e.g. 6-decimal USDC to
/// 18-decimal USDT). Scaling down truncates.
pub fn normalize_decimals(amount: U256, from: u8, to: u8) -> U256 {
    match from.cmp(&to) {
        std::cmp::Ordering::Equal => amount,
        std::cmp::Ordering::Less => amount.saturating_mul(pow10((to - from) as u32)),
        std::cmp::Ordering::Greater => amount / pow10((from - to) as u32),
    }
}

/// `amount * fraction`, truncated. Negative fractions yield zero.
pub fn mul_fraction(amount: U256, fraction: Decimal) -> U256 {
    if fraction.is_sign_negative() {
        return U256::ZERO;
    }
    let mantissa = U256::from(fraction.mantissa().unsigned_abs());
    amount.saturating_mul(mantissa) / pow10(fraction.scale())
}

/// `numerator / denominator` as a decimal fraction with 6 digits of precision.
pub fn ratio(numerator: U256, denominator: U256) -> Decimal {
    if denominator.is_zero() {
        return Decimal::ZERO;
    }
    let scaled = numerator.saturating_mul(U256::from(1_000_000u64)) / denominator;
    let scaled: u64 = scaled.try_into().unwrap_or(u64::MAX);
    Decimal::from(scaled) / Decimal::from(1_000_000u64)
}

pub fn to_numeric(amount: U256) -> BigDecimal {
    // U256 display is plain base-10 digits, always a valid numeric literal
    BigDecimal::from_str(&amount.to_string()).unwrap_or_default()
}

pub fn from_numeric(value: &BigDecimal) -> Result<U256, LedgerError> {
    let digits = value.with_scale(0).to_string();
    digits
        .parse::<U256>()
        .map_err(|_| LedgerError::InvalidAmount(digits))
}

pub fn decimal_to_numeric(value: Decimal) -> BigDecimal {
    BigDecimal::from_str(&value.to_string()).unwrap_or_default()
}

pub fn numeric_to_decimal(value: &BigDecimal) -> Decimal {
    Decimal::from_str(&value.to_string()).unwrap_or_default()
}
