//! Proration arithmetic for suspensions and contract minimums.
//!
//! Daily rates use nominal period lengths (7/14/30/365 days) rather than the
//! calendar length of the period in progress.

use chrono::{DateTime, Duration, Months, NaiveDate, Utc};
use rust_decimal::{Decimal, RoundingStrategy};

use crate::models::BillingFrequency;

/// Recurring amount divided by the nominal days in one billing period.
pub fn daily_rate(amount: Decimal, frequency: BillingFrequency) -> Decimal {
    amount / Decimal::from(frequency.nominal_days())
}

/// Earliest date a cancellation may take effect, or `None` when the price has
/// no minimum contract.
///
/// Weekly and fortnightly periods advance by whole days; monthly and yearly
/// periods advance by calendar months, clamping to the end of shorter months.
pub fn minimum_cancellation_date(
    start: DateTime<Utc>,
    frequency: BillingFrequency,
    min_cycles: Option<u32>,
) -> Option<DateTime<Utc>> {
    let cycles = min_cycles.filter(|c| *c > 0)?;

    match frequency {
        BillingFrequency::Weekly => Some(start + Duration::days(7 * i64::from(cycles))),
        BillingFrequency::Fortnightly => Some(start + Duration::days(14 * i64::from(cycles))),
        BillingFrequency::Monthly => start.checked_add_months(Months::new(cycles)),
        BillingFrequency::Yearly => start.checked_add_months(Months::new(cycles.checked_mul(12)?)),
    }
}

/// Whole days from `from` to `to`; negative when `to` is earlier.
pub fn days_between(from: NaiveDate, to: NaiveDate) -> i64 {
    (to - from).num_days()
}

/// Date billing resumes after a suspension of `days` starting on `start`.
pub fn resume_date(start: NaiveDate, days: u32) -> NaiveDate {
    start + Duration::days(i64::from(days))
}

/// Credit for suspending billing from `pause_start` for `requested_days`.
///
/// Only the days left in the current period are credited. Periods after
/// `next_billing` are skipped entirely, so they need no credit.
pub fn suspension_credit(
    daily_rate: Decimal,
    requested_days: u32,
    pause_start: NaiveDate,
    next_billing: NaiveDate,
) -> Decimal {
    let remaining = days_between(pause_start, next_billing).max(0);
    let credited_days = i64::from(requested_days).min(remaining);

    (daily_rate * Decimal::from(credited_days))
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Suspension credit for a price, never more than one period's amount.
pub fn period_suspension_credit(
    amount: Decimal,
    frequency: BillingFrequency,
    requested_days: u32,
    pause_start: NaiveDate,
    next_billing: NaiveDate,
) -> Decimal {
    suspension_credit(
        daily_rate(amount, frequency),
        requested_days,
        pause_start,
        next_billing,
    )
    .min(amount)
}
