//! Mirrors of objects owned by the payment processor.
//!
//! Field names follow the processor's wire format. Amounts are in minor
//! currency units and timestamps are Unix seconds.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Billing reason of the first invoice of a subscription.
pub const BILLING_REASON_SUBSCRIPTION_CREATE: &str = "subscription_create";

/// Currencies the processor bills in whole units.
const ZERO_DECIMAL_CURRENCIES: &[&str] = &[
    "bif", "clp", "djf", "gnf", "jpy", "kmf", "krw", "mga", "pyg", "rwf", "ugx", "vnd", "vuv",
    "xaf", "xof", "xpf",
];

/// Decimal places of one minor unit in `currency`.
pub fn currency_exponent(currency: &str) -> u32 {
    if ZERO_DECIMAL_CURRENCIES.contains(&currency.to_ascii_lowercase().as_str()) {
        0
    } else {
        2
    }
}

pub fn minor_to_decimal(amount: i64, currency: &str) -> Decimal {
    Decimal::new(amount, currency_exponent(currency))
}

pub fn decimal_to_minor(amount: Decimal, currency: &str) -> Option<i64> {
    let scale = Decimal::from(10_i64.pow(currency_exponent(currency)));
    (amount * scale).round().to_i64()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteSubscription {
    pub id: String,
    pub customer: String,
    pub status: String,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub current_period_start: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub current_period_end: DateTime<Utc>,
    #[serde(default, with = "chrono::serde::ts_seconds_option")]
    pub cancel_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    #[serde(default)]
    pub default_payment_method: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl RemoteSubscription {
    /// The date the processor will end this subscription, if one is pending.
    pub fn scheduled_end(&self) -> Option<DateTime<Utc>> {
        self.cancel_at.or_else(|| {
            self.cancel_at_period_end
                .then_some(self.current_period_end)
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Open,
    Paid,
    Uncollectible,
    Void,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Period {
    #[serde(with = "chrono::serde::ts_seconds")]
    pub start: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceLine {
    pub period: Period,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvoiceLines {
    #[serde(default)]
    pub data: Vec<InvoiceLine>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: String,
    pub customer: String,
    pub subscription: Option<String>,
    pub status: InvoiceStatus,
    pub billing_reason: Option<String>,
    pub amount_due: i64,
    #[serde(default)]
    pub amount_paid: i64,
    pub subtotal: i64,
    #[serde(default)]
    pub tax: Option<i64>,
    pub total: i64,
    pub currency: String,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub created: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub period_start: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub period_end: DateTime<Utc>,
    #[serde(default)]
    pub lines: InvoiceLines,
    #[serde(default)]
    pub payment_intent: Option<String>,
    #[serde(default)]
    pub customer_email: Option<String>,
}

impl Invoice {
    pub fn is_subscription_create(&self) -> bool {
        self.billing_reason.as_deref() == Some(BILLING_REASON_SUBSCRIPTION_CREATE)
    }

    /// Service period billed by this invoice. Subscription invoices report the
    /// period on their line items; the top-level fields are a fallback.
    pub fn service_period(&self) -> Period {
        self.lines
            .data
            .first()
            .map(|line| line.period)
            .unwrap_or(Period {
                start: self.period_start,
                end: self.period_end,
            })
    }

    pub fn tax_amount(&self) -> i64 {
        self.tax.unwrap_or(self.total - self.subtotal).max(0)
    }
}

/// Payment method types that can be charged again without the customer
/// present.
const REUSABLE_PAYMENT_METHOD_TYPES: &[&str] = &["card", "sepa_debit", "us_bank_account"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentMethod {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub customer: Option<String>,
}

impl PaymentMethod {
    /// `card_present` and `interac_present` methods from a terminal are single
    /// use and cannot back future automatic renewals.
    pub fn is_reusable(&self) -> bool {
        REUSABLE_PAYMENT_METHOD_TYPES.contains(&self.kind.as_str())
    }
}

/// `payment_method` on a payment intent is either an id or, when expanded,
/// the full object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PaymentMethodRef {
    Id(String),
    Expanded(PaymentMethod),
}

impl PaymentMethodRef {
    pub fn id(&self) -> &str {
        match self {
            PaymentMethodRef::Id(id) => id,
            PaymentMethodRef::Expanded(pm) => &pm.id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub id: String,
    pub status: String,
    pub amount: i64,
    pub currency: String,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub payment_method: Option<PaymentMethodRef>,
}

impl PaymentIntent {
    pub fn succeeded(&self) -> bool {
        self.status == "succeeded"
    }

    /// The charge is neither confirmed nor finally declined, so funds may
    /// still move after the caller gives up on it.
    pub fn may_still_settle(&self) -> bool {
        matches!(
            self.status.as_str(),
            "processing" | "requires_capture" | "requires_action" | "requires_confirmation"
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventData {
    pub object: serde_json::Value,
}

/// An asynchronously delivered billing event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub created: DateTime<Utc>,
    pub data: EventData,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minor_units_round_trip_cents() {
        assert_eq!(minor_to_decimal(3333, "usd"), Decimal::new(3333, 2));
        assert_eq!(decimal_to_minor(Decimal::new(3333, 2), "usd"), Some(3333));
        assert_eq!(decimal_to_minor(Decimal::new(33335, 3), "usd"), Some(3334));
    }

    #[test]
    fn zero_decimal_currencies_are_whole_units() {
        assert_eq!(minor_to_decimal(5000, "jpy"), Decimal::new(5000, 0));
        assert_eq!(minor_to_decimal(5000, "JPY"), Decimal::new(5000, 0));
        assert_eq!(decimal_to_minor(Decimal::new(16667, 2), "jpy"), Some(167));
        assert_eq!(currency_exponent("eur"), 2);
    }

    #[test]
    fn pending_intents_may_still_settle() {
        let intent = |status: &str| PaymentIntent {
            id: "pi_1".into(),
            status: status.into(),
            amount: 100,
            currency: "usd".into(),
            customer: None,
            payment_method: None,
        };
        assert!(intent("processing").may_still_settle());
        assert!(!intent("requires_payment_method").may_still_settle());
        assert!(!intent("canceled").may_still_settle());
        assert!(!intent("succeeded").may_still_settle());
    }

    #[test]
    fn terminal_methods_are_not_reusable() {
        let present = PaymentMethod {
            id: "pm_1".into(),
            kind: "card_present".into(),
            customer: None,
        };
        let card = PaymentMethod {
            id: "pm_2".into(),
            kind: "card".into(),
            customer: None,
        };
        assert!(!present.is_reusable());
        assert!(card.is_reusable());
    }

    #[test]
    fn invoice_deserializes_from_wire_format() {
        let json = serde_json::json!({
            "id": "in_1",
            "customer": "cus_1",
            "subscription": "sub_1",
            "status": "paid",
            "billing_reason": "subscription_cycle",
            "amount_due": 11000,
            "amount_paid": 11000,
            "subtotal": 10000,
            "tax": 1000,
            "total": 11000,
            "currency": "usd",
            "created": 1706745600,
            "period_start": 1704067200,
            "period_end": 1706745600,
            "lines": { "data": [ { "period": { "start": 1706745600, "end": 1709251200 } } ] }
        });

        let invoice: Invoice = serde_json::from_value(json).unwrap();
        assert!(!invoice.is_subscription_create());
        assert_eq!(invoice.tax_amount(), 1000);
        assert_eq!(invoice.service_period().end.timestamp(), 1709251200);
    }

    #[test]
    fn expanded_payment_method_is_detected() {
        let json = serde_json::json!({
            "id": "pi_1",
            "status": "succeeded",
            "amount": 5000,
            "currency": "usd",
            "payment_method": { "id": "pm_1", "type": "card_present" }
        });

        let intent: PaymentIntent = serde_json::from_value(json).unwrap();
        match intent.payment_method {
            Some(PaymentMethodRef::Expanded(pm)) => assert!(!pm.is_reusable()),
            other => panic!("expected expanded payment method, got {:?}", other),
        }
    }
}
