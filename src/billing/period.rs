//! Billing period arithmetic.
//!
//! Calendar intervals (months, years) follow chrono's month arithmetic, so a
//! period starting on Jan 31 ends on the last day of February.

use chrono::{DateTime, Duration, Months, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Billing interval unit; combined with an interval count on the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingInterval {
    Day,
    Week,
    Month,
    Year,
}

impl BillingInterval {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
            Self::Year => "year",
        }
    }
}

impl std::fmt::Display for BillingInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for BillingInterval {
    type Err = crate::error::BillflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "day" => Ok(Self::Day),
            "week" => Ok(Self::Week),
            "month" => Ok(Self::Month),
            "year" => Ok(Self::Year),
            other => Err(crate::error::BillflowError::invalid_input(format!(
                "Unknown billing interval: {}",
                other
            ))),
        }
    }
}

/// Advance `start` by `count` intervals.
///
/// A zero count is treated as one so the resulting period is never empty.
#[must_use]
pub fn advance(start: DateTime<Utc>, interval: BillingInterval, count: u32) -> DateTime<Utc> {
    let count = count.max(1);
    let advanced = match interval {
        BillingInterval::Day => start.checked_add_signed(Duration::days(i64::from(count))),
        BillingInterval::Week => start.checked_add_signed(Duration::weeks(i64::from(count))),
        BillingInterval::Month => start.checked_add_months(Months::new(count)),
        BillingInterval::Year => start.checked_add_months(Months::new(count.saturating_mul(12))),
    };
    advanced.unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Whole days from `from` to `to`, rounding partial days up; never negative.
#[must_use]
pub fn days_between(from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
    let seconds = (to - from).num_seconds();
    if seconds <= 0 {
        return 0;
    }
    (seconds + 86_399) / 86_400
}

/// Normalize one period's amount to a monthly amount.
///
/// day x30, week x4, month x1, year /12, then divided by the interval count.
#[must_use]
pub fn monthly_amount(amount: Decimal, interval: BillingInterval, count: u32) -> Decimal {
    let count = Decimal::from(count.max(1));
    match interval {
        BillingInterval::Day => amount * Decimal::from(30) / count,
        BillingInterval::Week => amount * Decimal::from(4) / count,
        BillingInterval::Month => amount / count,
        BillingInterval::Year => amount / (Decimal::from(12) * count),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_advance_calendar_intervals() {
        assert_eq!(advance(at(2024, 1, 15), BillingInterval::Month, 1), at(2024, 2, 15));
        assert_eq!(advance(at(2024, 1, 31), BillingInterval::Month, 1), at(2024, 2, 29));
        assert_eq!(advance(at(2024, 2, 29), BillingInterval::Year, 1), at(2025, 2, 28));
        assert_eq!(advance(at(2024, 1, 1), BillingInterval::Month, 3), at(2024, 4, 1));
    }

    #[test]
    fn test_advance_fixed_intervals() {
        assert_eq!(advance(at(2024, 1, 1), BillingInterval::Day, 10), at(2024, 1, 11));
        assert_eq!(advance(at(2024, 1, 1), BillingInterval::Week, 2), at(2024, 1, 15));
        assert_eq!(advance(at(2024, 1, 1), BillingInterval::Day, 0), at(2024, 1, 2));
    }

    #[test]
    fn test_days_between() {
        assert_eq!(days_between(at(2024, 1, 1), at(2024, 1, 31)), 30);
        assert_eq!(days_between(at(2024, 1, 31), at(2024, 1, 1)), 0);
        let half_day = at(2024, 1, 1) + Duration::hours(12);
        assert_eq!(days_between(at(2024, 1, 1), half_day), 1);
        assert_eq!(days_between(half_day, half_day), 0);
    }

    #[test]
    fn test_monthly_amount() {
        let amount = Decimal::from(1200);
        assert_eq!(monthly_amount(Decimal::from(10), BillingInterval::Day, 1), Decimal::from(300));
        assert_eq!(monthly_amount(Decimal::from(25), BillingInterval::Week, 1), Decimal::from(100));
        assert_eq!(monthly_amount(Decimal::from(300), BillingInterval::Month, 3), Decimal::from(100));
        assert_eq!(monthly_amount(amount, BillingInterval::Year, 1), Decimal::from(100));
    }

    #[test]
    fn test_interval_parse() {
        assert_eq!("Month".parse::<BillingInterval>().unwrap(), BillingInterval::Month);
        assert!("fortnight".parse::<BillingInterval>().is_err());
    }
}
