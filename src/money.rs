//! Money Conversion Module
//!
//! Conversion between client-facing string amounts and the ledger's `Decimal`
//! representation. Every ledger entry point goes through [`parse_amount`].
//!
//! ## Rules
//! 1. All assets use a fixed precision of [`ASSET_DECIMALS`] (6) fractional digits
//! 2. No silent truncation: more fractional digits than allowed is an error
//! 3. Amounts entering the ledger are strictly positive
//!
//! ```rust
//! use wallet_ledger::money::{format_amount, parse_amount};
//!
//! let amount = parse_amount("1.5").unwrap();
//! assert_eq!(format_amount(amount), "1.500000");
//! ```

use rust_decimal::prelude::*;
use thiserror::Error;

/// Fixed per-asset precision, matches `NUMERIC(30,6)` columns
pub const ASSET_DECIMALS: u32 = 6;

/// Money conversion errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MoneyError {
    #[error("Precision overflow: provided {provided} decimals, max allowed {max}")]
    PrecisionOverflow { provided: u32, max: u32 },

    #[error("Amount must be positive")]
    NotPositive,

    #[error("Invalid format: {0}")]
    InvalidFormat(String),
}

/// Parse a client string amount into a positive `Decimal` at asset precision
///
/// # Errors
/// * `InvalidFormat` - empty, leading/trailing dot, exponent, non-digit characters
/// * `PrecisionOverflow` - more than 6 fractional digits
/// * `NotPositive` - zero or negative
pub fn parse_amount(amount_str: &str) -> Result<Decimal, MoneyError> {
    let amount_str = amount_str.trim();
    if amount_str.is_empty() {
        return Err(MoneyError::InvalidFormat("empty string".into()));
    }

    if amount_str.starts_with('-') {
        return Err(MoneyError::NotPositive);
    }

    let digits = amount_str.strip_prefix('+').unwrap_or(amount_str);
    let (whole, frac) = match digits.split_once('.') {
        None => (digits, ""),
        Some((w, f)) => {
            // Require both sides of the dot: "0.5" not ".5", "5.0" not "5."
            if w.is_empty() || f.is_empty() {
                return Err(MoneyError::InvalidFormat(format!(
                    "ambiguous decimal point: {}",
                    amount_str
                )));
            }
            (w, f)
        }
    };

    if !whole.bytes().all(|b| b.is_ascii_digit()) || !frac.bytes().all(|b| b.is_ascii_digit()) {
        return Err(MoneyError::InvalidFormat(format!(
            "invalid character in amount: {}",
            amount_str
        )));
    }

    if frac.len() > ASSET_DECIMALS as usize {
        return Err(MoneyError::PrecisionOverflow {
            provided: frac.len() as u32,
            max: ASSET_DECIMALS,
        });
    }

    let value = Decimal::from_str(digits)
        .map_err(|e| MoneyError::InvalidFormat(format!("{}: {}", amount_str, e)))?;

    normalize(value)
}

/// Validate an already-typed `Decimal` and rescale it to asset precision
pub fn normalize(value: Decimal) -> Result<Decimal, MoneyError> {
    let mut scaled = value.normalize();
    if scaled.scale() > ASSET_DECIMALS {
        return Err(MoneyError::PrecisionOverflow {
            provided: scaled.scale(),
            max: ASSET_DECIMALS,
        });
    }

    if scaled <= Decimal::ZERO {
        return Err(MoneyError::NotPositive);
    }

    scaled.rescale(ASSET_DECIMALS);
    Ok(scaled)
}

/// Render a balance at asset precision, e.g. `"100.000000"`
pub fn format_amount(value: Decimal) -> String {
    let mut v = value;
    v.rescale(ASSET_DECIMALS);
    v.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_integer_and_fraction() {
        assert_eq!(parse_amount("10").unwrap(), Decimal::new(10_000_000, 6));
        assert_eq!(parse_amount("0.000001").unwrap(), Decimal::new(1, 6));
        assert_eq!(parse_amount(" 60 ").unwrap().to_string(), "60.000000");
    }

    #[test]
    fn test_parse_rejects_non_positive() {
        assert_eq!(parse_amount("0"), Err(MoneyError::NotPositive));
        assert_eq!(parse_amount("0.000000"), Err(MoneyError::NotPositive));
        assert_eq!(parse_amount("-5"), Err(MoneyError::NotPositive));
    }

    #[test]
    fn test_parse_rejects_excess_precision() {
        assert_eq!(
            parse_amount("1.0000001"),
            Err(MoneyError::PrecisionOverflow {
                provided: 7,
                max: 6
            })
        );
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in ["", ".5", "5.", "1e3", "1,000", "abc", "1.2.3", "--1"] {
            assert!(
                matches!(
                    parse_amount(bad),
                    Err(MoneyError::InvalidFormat(_)) | Err(MoneyError::NotPositive)
                ),
                "expected rejection for {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_normalize_accepts_trailing_zeros_beyond_scale() {
        let v = Decimal::from_str("2.50000000").unwrap();
        assert_eq!(normalize(v).unwrap().to_string(), "2.500000");
    }

    #[test]
    fn test_format_amount() {
        assert_eq!(format_amount(Decimal::from(100)), "100.000000");
        assert_eq!(format_amount(Decimal::new(4, 1)), "0.400000");
    }
}
