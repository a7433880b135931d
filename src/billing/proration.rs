//! Proration for mid-cycle plan and quantity changes.
//!
//! Amounts are prorated by whole days: the unused share of the current
//! line value is credited and the same share of the new line value is
//! charged.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{BillflowError, Result};
use super::money::round_money;
use super::period::days_between;

/// Credit, charge and net amount for a mid-cycle change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProratedAmount {
    /// Unused share of the current line value.
    pub credit: Decimal,
    /// Remaining share of the new line value.
    pub charge: Decimal,
    /// `charge - credit`; negative when the customer is owed money.
    pub net_amount: Decimal,
    pub total_days: i64,
    pub remaining_days: i64,
}

impl ProratedAmount {
    /// Whether the change results in a charge to the customer.
    #[must_use]
    pub fn is_charge(&self) -> bool {
        self.net_amount > Decimal::ZERO
    }
}

/// Prorate a change at `at` within the period `[start, end)`.
///
/// `at` must lie within `[start, end]`; callers clamp it first. A same-day
/// period (`total_days == 0`) charges the full new amount with no credit.
///
/// # Errors
///
/// Returns `InvalidInput` if `at` lies outside the period or `end < start`.
pub fn calculate_proration(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    current_amount: Decimal,
    new_amount: Decimal,
    at: DateTime<Utc>,
) -> Result<ProratedAmount> {
    if end < start {
        return Err(BillflowError::invalid_input(
            "Proration period ends before it starts",
        ));
    }
    if at < start || at > end {
        return Err(BillflowError::invalid_input(format!(
            "Proration time {} is outside the period {} - {}",
            at, start, end
        )));
    }

    let total_days = days_between(start, end);
    if total_days == 0 {
        let charge = round_money(new_amount);
        return Ok(ProratedAmount {
            credit: Decimal::ZERO,
            charge,
            net_amount: charge,
            total_days: 0,
            remaining_days: 0,
        });
    }

    let remaining_days = days_between(at, end).min(total_days);
    let total = Decimal::from(total_days);
    let remaining = Decimal::from(remaining_days);

    let credit = round_money(current_amount / total * remaining);
    let charge = round_money(new_amount / total * remaining);

    Ok(ProratedAmount {
        credit,
        charge,
        net_amount: round_money(charge - credit),
        total_days,
        remaining_days,
    })
}

/// Clamp `at` into `[start, end]`.
#[must_use]
pub fn clamp_to_period(at: DateTime<Utc>, start: DateTime<Utc>, end: DateTime<Utc>) -> DateTime<Utc> {
    at.max(start).min(end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn period() -> (DateTime<Utc>, DateTime<Utc>) {
        let start = Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap();
        (start, start + Duration::days(30))
    }

    #[test]
    fn test_ten_of_thirty_days_remaining() {
        let (start, end) = period();
        let at = end - Duration::days(10);
        let p = calculate_proration(start, end, Decimal::from(30), Decimal::from(60), at).unwrap();
        assert_eq!(p.total_days, 30);
        assert_eq!(p.remaining_days, 10);
        assert_eq!(p.credit, Decimal::new(1000, 2));
        assert_eq!(p.charge, Decimal::new(2000, 2));
        assert_eq!(p.net_amount, Decimal::new(1000, 2));
        assert!(p.is_charge());
    }

    #[test]
    fn test_boundaries() {
        let (start, end) = period();
        let current = Decimal::from(30);

        let at_start = calculate_proration(start, end, current, Decimal::from(60), start).unwrap();
        assert_eq!(at_start.credit, current);

        let at_end = calculate_proration(start, end, current, Decimal::from(60), end).unwrap();
        assert_eq!(at_end.credit, Decimal::ZERO);
        assert_eq!(at_end.charge, Decimal::ZERO);
    }

    #[test]
    fn test_same_day_period() {
        let (start, _) = period();
        let p = calculate_proration(start, start, Decimal::from(30), Decimal::from(60), start).unwrap();
        assert_eq!(p.credit, Decimal::ZERO);
        assert_eq!(p.charge, Decimal::from(60));
        assert_eq!(p.net_amount, Decimal::from(60));
    }

    #[test]
    fn test_downgrade_is_negative() {
        let (start, end) = period();
        let at = start + Duration::days(15);
        let p = calculate_proration(start, end, Decimal::from(60), Decimal::from(30), at).unwrap();
        assert_eq!(p.net_amount, Decimal::new(-1500, 2));
        assert!(!p.is_charge());
    }

    #[test]
    fn test_rounds_to_cents() {
        let (start, end) = period();
        let at = end - Duration::days(7);
        let p = calculate_proration(start, end, Decimal::from(10), Decimal::from(20), at).unwrap();
        // 10 / 30 * 7 = 2.3333..
        assert_eq!(p.credit, Decimal::new(233, 2));
        assert_eq!(p.charge, Decimal::new(467, 2));
        assert_eq!(p.net_amount, Decimal::new(234, 2));
    }

    #[test]
    fn test_outside_period_rejected() {
        let (start, end) = period();
        let err = calculate_proration(start, end, Decimal::ONE, Decimal::ONE, end + Duration::days(1))
            .unwrap_err();
        assert!(matches!(err, BillflowError::InvalidInput(_)));

        let clamped = clamp_to_period(end + Duration::days(1), start, end);
        assert_eq!(clamped, end);
    }
}
