//! Currency-safe amount helpers.
//!
//! Amounts are `rust_decimal::Decimal` in major units (`12.34`). Rounding is
//! always half away from zero at the cent boundary.

use rust_decimal::{Decimal, RoundingStrategy};

/// Decimal places kept for every stored or reported amount.
pub const MONEY_SCALE: u32 = 2;

/// Round to cents, half away from zero (`0.005 -> 0.01`, `-0.005 -> -0.01`).
#[must_use]
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// Convert a major-unit amount to minor units (cents) for gateway adapters.
#[must_use]
pub fn to_minor_units(amount: Decimal) -> Option<i64> {
    use rust_decimal::prelude::ToPrimitive;
    (round_money(amount) * Decimal::ONE_HUNDRED).to_i64()
}

/// Convert a minor-unit amount (cents) reported by a gateway to major units.
#[must_use]
pub fn from_minor_units(minor: i64) -> Decimal {
    Decimal::new(minor, MONEY_SCALE)
}

/// Normalize an ISO currency code to the lowercase form used in storage.
#[must_use]
pub fn normalize_currency(code: &str) -> String {
    code.trim().to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_half_away_from_zero() {
        assert_eq!(round_money(Decimal::new(1005, 3)), Decimal::new(101, 2));
        assert_eq!(round_money(Decimal::new(-1005, 3)), Decimal::new(-101, 2));
        assert_eq!(round_money(Decimal::new(1004, 3)), Decimal::new(100, 2));
        assert_eq!(round_money(Decimal::new(3333333, 5)), Decimal::new(3333, 2));
    }

    #[test]
    fn test_minor_unit_conversion() {
        assert_eq!(to_minor_units(Decimal::new(9900, 0)), Some(990_000));
        assert_eq!(to_minor_units(Decimal::new(1234, 2)), Some(1234));
        assert_eq!(from_minor_units(1234), Decimal::new(1234, 2));
    }

    #[test]
    fn test_normalize_currency() {
        assert_eq!(normalize_currency(" USD "), "usd");
    }
}
