//! Membership model.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::price::Price;

const BILLED_INVOICE_HISTORY: usize = 24;

/// Membership status.
///
/// A membership scheduled for cancellation stays `Active` with
/// `cancel_at_period_end` set until the processor ends the subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipStatus {
    Active,
    Suspended,
    Cancelled,
}

impl MembershipStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MembershipStatus::Active => "active",
            MembershipStatus::Suspended => "suspended",
            MembershipStatus::Cancelled => "cancelled",
        }
    }
}

/// One entry in a membership's suspension history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suspension {
    pub start_date: NaiveDate,
    pub days: u32,
    pub note: String,
    pub credit_amount: Decimal,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

impl Suspension {
    pub fn resume_date(&self) -> NaiveDate {
        crate::proration::resume_date(self.start_date, self.days)
    }
}

/// A customer's enrollment in one billable product price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Membership {
    #[serde(rename = "_id")]
    pub id: String,
    pub org_id: String,
    pub customer_id: String,
    pub customer_email: Option<String>,
    pub product_id: String,
    pub price: Price,

    pub status: MembershipStatus,
    pub subscription_id: Option<String>,
    pub subscription_start_date: DateTime<Utc>,
    pub last_billing_date: DateTime<Utc>,
    pub next_billing_date: DateTime<Utc>,

    #[serde(default)]
    pub cancel_at_period_end: bool,
    pub cancellation_scheduled_for: Option<DateTime<Utc>>,
    pub cancellation_reason: Option<String>,
    pub cancelled_by: Option<String>,
    pub cancelled_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub has_limited_billing: bool,
    pub billing_max: Option<u32>,
    #[serde(default)]
    pub billing_count: u32,

    #[serde(default)]
    pub suspensions: Vec<Suspension>,

    /// Most recent invoices already applied to the billing dates and count.
    #[serde(default)]
    pub billed_invoice_ids: Vec<String>,

    /// Optimistic concurrency token, bumped by every successful save.
    #[serde(default)]
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a membership once its subscription exists remotely.
#[derive(Debug, Clone)]
pub struct NewMembership {
    pub org_id: String,
    pub customer_id: String,
    pub customer_email: Option<String>,
    pub product_id: String,
    pub price: Price,
    pub subscription_id: String,
    pub start_date: DateTime<Utc>,
    pub next_billing_date: DateTime<Utc>,
    pub billing_max: Option<u32>,
}

impl Membership {
    pub fn new(input: NewMembership) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            org_id: input.org_id,
            customer_id: input.customer_id,
            customer_email: input.customer_email,
            product_id: input.product_id,
            price: input.price,
            status: MembershipStatus::Active,
            subscription_id: Some(input.subscription_id),
            subscription_start_date: input.start_date,
            last_billing_date: input.start_date,
            next_billing_date: input.next_billing_date,
            cancel_at_period_end: false,
            cancellation_scheduled_for: None,
            cancellation_reason: None,
            cancelled_by: None,
            cancelled_at: None,
            has_limited_billing: input.billing_max.is_some(),
            billing_max: input.billing_max,
            billing_count: 0,
            suspensions: Vec::new(),
            billed_invoice_ids: Vec::new(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_scheduled_for_cancellation(&self) -> bool {
        self.cancel_at_period_end
    }

    /// Record a pending cancellation on `scheduled_for`.
    pub fn schedule_cancellation(
        &mut self,
        scheduled_for: DateTime<Utc>,
        reason: impl Into<String>,
        cancelled_by: impl Into<String>,
    ) {
        self.cancel_at_period_end = true;
        self.cancellation_scheduled_for = Some(scheduled_for);
        self.cancellation_reason = Some(reason.into());
        self.cancelled_by = Some(cancelled_by.into());
        self.cancelled_at = Some(Utc::now());
    }

    pub fn clear_cancellation(&mut self) {
        self.cancel_at_period_end = false;
        self.cancellation_scheduled_for = None;
        self.cancellation_reason = None;
        self.cancelled_by = None;
        self.cancelled_at = None;
    }

    /// Apply a settled billing period. Dates only move forward, so a late
    /// delivery of an older invoice leaves them alone.
    pub fn record_billing(&mut self, billed_at: DateTime<Utc>, next_billing: DateTime<Utc>) {
        self.last_billing_date = self.last_billing_date.max(billed_at);
        self.next_billing_date = self
            .next_billing_date
            .max(next_billing)
            .max(self.last_billing_date);
        if self.status == MembershipStatus::Suspended {
            self.status = MembershipStatus::Active;
        }
    }

    pub fn has_billed_invoice(&self, invoice_id: &str) -> bool {
        self.billed_invoice_ids.iter().any(|id| id == invoice_id)
    }

    /// Remember that `invoice_id` has been applied, keeping a bounded history.
    pub fn mark_invoice_billed(&mut self, invoice_id: &str) {
        if self.has_billed_invoice(invoice_id) {
            return;
        }
        self.billed_invoice_ids.push(invoice_id.to_string());
        if self.billed_invoice_ids.len() > BILLED_INVOICE_HISTORY {
            let excess = self.billed_invoice_ids.len() - BILLED_INVOICE_HISTORY;
            self.billed_invoice_ids.drain(..excess);
        }
    }

    /// Days of suspension already started in `year`.
    pub fn suspended_days_in_year(&self, year: i32) -> u32 {
        use chrono::Datelike;
        self.suspensions
            .iter()
            .filter(|s| s.start_date.year() == year)
            .map(|s| s.days)
            .sum()
    }

    /// Check the record-level invariants before it is written.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.next_billing_date < self.last_billing_date {
            return Err(format!(
                "next_billing_date {} precedes last_billing_date {}",
                self.next_billing_date, self.last_billing_date
            ));
        }
        if self.cancel_at_period_end != self.cancellation_scheduled_for.is_some() {
            return Err("cancel_at_period_end and cancellation_scheduled_for disagree".to_string());
        }
        if self.status == MembershipStatus::Active
            && !self.cancel_at_period_end
            && (self.cancellation_reason.is_some()
                || self.cancelled_by.is_some()
                || self.cancelled_at.is_some())
        {
            return Err("active membership carries stale cancellation fields".to_string());
        }
        if self.has_limited_billing {
            if let Some(max) = self.billing_max {
                if self.billing_count > max {
                    return Err(format!(
                        "billing_count {} exceeds billing_max {}",
                        self.billing_count, max
                    ));
                }
            }
        }
        Ok(())
    }
}
