//! Ledger transaction model.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What produced a ledger entry. Stored as `metadata.type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    SubscriptionRenewal,
    MembershipRecovery,
    RenewalFailure,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::SubscriptionRenewal => "subscription_renewal",
            TransactionKind::MembershipRecovery => "membership_recovery",
            TransactionKind::RenewalFailure => "renewal_failure",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionMetadata {
    #[serde(rename = "type")]
    pub kind: TransactionKind,
    pub billing_reason: Option<String>,
    pub description: Option<String>,
}

/// Immutable financial record for a renewal, a recovery, or a failed renewal
/// attempt. Only `recovered_by` is ever written after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    #[serde(rename = "_id")]
    pub id: String,
    pub org_id: String,
    pub customer_id: String,
    pub membership_id: Option<String>,
    pub amount: Decimal,
    pub subtotal: Decimal,
    pub tax: Decimal,
    pub currency: String,
    pub status: TransactionStatus,
    pub invoice_id: String,
    pub subscription_id: String,
    pub payment_intent_id: Option<String>,
    pub metadata: TransactionMetadata,
    pub recovered_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Input for a new ledger entry.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub kind: TransactionKind,
    pub status: TransactionStatus,
    pub org_id: String,
    pub customer_id: String,
    pub membership_id: Option<String>,
    pub amount: Decimal,
    pub subtotal: Decimal,
    pub tax: Decimal,
    pub currency: String,
    pub invoice_id: String,
    pub subscription_id: String,
    pub payment_intent_id: Option<String>,
    pub billing_reason: Option<String>,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    pub fn new(input: NewTransaction) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            org_id: input.org_id,
            customer_id: input.customer_id,
            membership_id: input.membership_id,
            amount: input.amount,
            subtotal: input.subtotal,
            tax: input.tax,
            currency: input.currency,
            status: input.status,
            invoice_id: input.invoice_id,
            subscription_id: input.subscription_id,
            payment_intent_id: input.payment_intent_id,
            metadata: TransactionMetadata {
                kind: input.kind,
                billing_reason: input.billing_reason,
                description: input.description,
            },
            recovered_by: None,
            created_at: input.created_at,
        }
    }

    pub fn kind(&self) -> TransactionKind {
        self.metadata.kind
    }
}
