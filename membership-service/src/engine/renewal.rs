//! Billing events pushed by the processor.
//!
//! Deliveries may repeat or arrive out of order. A renewal is recorded at most
//! once per invoice; the ledger's `(invoice_id, kind)` uniqueness is the final
//! guard when two deliveries race. The membership keeps the ids of invoices it
//! has been rolled forward for, so a redelivery can finish an update an
//! earlier delivery left undone without applying it twice.

use super::{MembershipEngine, SYSTEM_ACTOR};
use crate::error::MembershipError;
use crate::models::remote::minor_to_decimal;
use crate::models::{
    BillingEvent, Invoice, Membership, MembershipStatus, NewTransaction, RemoteSubscription,
    Transaction, TransactionKind, TransactionStatus,
};
use crate::services::gateway::{CancellationUpdate, SubscriptionUpdate};
use crate::services::metrics::{record_billing_event, record_receipt};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, instrument, warn};

pub const EVENT_PAYMENT_SUCCEEDED: &str = "invoice.payment_succeeded";
pub const EVENT_PAYMENT_FAILED: &str = "invoice.payment_failed";
pub const EVENT_SUBSCRIPTION_DELETED: &str = "customer.subscription.deleted";

const REQUIRED_METADATA: [&str; 3] = ["customer_id", "org_id", "product_id"];
const BILLING_LIMIT_REASON: &str = "billing limit reached";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RenewalStatus {
    Recorded,
    Duplicate,
    Skipped,
}

/// What happened to a limited-billing membership on this renewal.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BillingEnforcement {
    NotApplicable,
    Counted {
        billing_count: u32,
        billing_max: u32,
    },
    CancellationScheduled {
        billing_count: u32,
        scheduled_for: DateTime<Utc>,
    },
    /// The limit was reached but the processor refused the cancellation.
    Failed {
        billing_count: u32,
        error: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct RenewalOutcome {
    pub status: RenewalStatus,
    pub invoice_id: String,
    pub transaction_id: Option<String>,
    pub membership_id: Option<String>,
    pub billing_enforcement: BillingEnforcement,
    pub receipt_sent: bool,
}

impl RenewalOutcome {
    fn skipped(invoice_id: &str) -> Self {
        Self {
            status: RenewalStatus::Skipped,
            invoice_id: invoice_id.to_string(),
            transaction_id: None,
            membership_id: None,
            billing_enforcement: BillingEnforcement::NotApplicable,
            receipt_sent: false,
        }
    }

    fn duplicate(existing: &Transaction) -> Self {
        Self {
            status: RenewalStatus::Duplicate,
            invoice_id: existing.invoice_id.clone(),
            transaction_id: Some(existing.id.clone()),
            membership_id: existing.membership_id.clone(),
            billing_enforcement: BillingEnforcement::NotApplicable,
            receipt_sent: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "handled", rename_all = "snake_case")]
pub enum EventOutcome {
    PaymentSucceeded(RenewalOutcome),
    PaymentFailed(RenewalOutcome),
    SubscriptionDeleted { subscription_id: String },
    Ignored { event_type: String },
}

/// Subscription metadata fields a renewal needs, or the names of those missing.
fn required_metadata(
    subscription: &RemoteSubscription,
) -> Result<(String, String, String), MembershipError> {
    let missing: Vec<&str> = REQUIRED_METADATA
        .iter()
        .copied()
        .filter(|key| {
            subscription
                .metadata
                .get(*key)
                .map_or(true, |v| v.is_empty())
        })
        .collect();

    if !missing.is_empty() {
        return Err(MembershipError::MissingMetadata {
            subscription_id: subscription.id.clone(),
            missing: missing.join(", "),
        });
    }

    let get = |key: &str| subscription.metadata.get(key).cloned().unwrap_or_default();
    Ok((get("customer_id"), get("org_id"), get("product_id")))
}

fn invoice_subscription(invoice: &Invoice) -> Result<&str, MembershipError> {
    invoice.subscription.as_deref().ok_or_else(|| {
        MembershipError::Validation(format!("Invoice {} has no subscription", invoice.id))
    })
}

impl MembershipEngine {
    /// Dispatch a verified billing event.
    #[instrument(skip(self, event), fields(event_id = %event.id, event_type = %event.event_type))]
    pub async fn handle_event(&self, event: BillingEvent) -> Result<EventOutcome, MembershipError> {
        let result = match event.event_type.as_str() {
            EVENT_PAYMENT_SUCCEEDED => {
                let invoice: Invoice = parse_object(&event)?;
                self.process_renewal_event(&invoice)
                    .await
                    .map(EventOutcome::PaymentSucceeded)
            }
            EVENT_PAYMENT_FAILED => {
                let invoice: Invoice = parse_object(&event)?;
                self.process_payment_failed(&invoice)
                    .await
                    .map(EventOutcome::PaymentFailed)
            }
            EVENT_SUBSCRIPTION_DELETED => {
                let subscription: RemoteSubscription = parse_object(&event)?;
                self.process_subscription_deleted(&subscription);
                Ok(EventOutcome::SubscriptionDeleted {
                    subscription_id: subscription.id,
                })
            }
            other => {
                info!(event_type = other, "Ignoring unhandled billing event");
                Ok(EventOutcome::Ignored {
                    event_type: other.to_string(),
                })
            }
        };

        if let Err(e) = &result {
            record_billing_event(&event.event_type, e.kind());
        }
        result
    }

    /// Record a paid renewal invoice and roll the membership forward.
    #[instrument(skip(self, invoice), fields(invoice_id = %invoice.id))]
    pub async fn process_renewal_event(
        &self,
        invoice: &Invoice,
    ) -> Result<RenewalOutcome, MembershipError> {
        if invoice.is_subscription_create() {
            info!("First invoice of a subscription, nothing to renew");
            record_billing_event(EVENT_PAYMENT_SUCCEEDED, "skipped");
            return Ok(RenewalOutcome::skipped(&invoice.id));
        }
        let subscription_id = invoice_subscription(invoice)?;

        if let Some(existing) = self
            .existing_transaction(&invoice.id, TransactionKind::SubscriptionRenewal)
            .await?
        {
            info!(transaction_id = %existing.id, "Renewal already recorded");
            record_billing_event(EVENT_PAYMENT_SUCCEEDED, "duplicate");
            return self.finish_duplicate(&existing, invoice).await;
        }

        let subscription = self.gateway.retrieve_subscription(subscription_id).await?;
        let (customer_id, org_id, product_id) = required_metadata(&subscription)?;

        let membership = self
            .store
            .find_active_or_suspended_by_subscription(subscription_id)
            .await?
            .into_iter()
            .find(|m| m.customer_id == customer_id && m.product_id == product_id);

        let transaction = Transaction::new(NewTransaction {
            kind: TransactionKind::SubscriptionRenewal,
            status: TransactionStatus::Succeeded,
            org_id: org_id.clone(),
            customer_id: customer_id.clone(),
            membership_id: membership.as_ref().map(|m| m.id.clone()),
            amount: minor_to_decimal(invoice.amount_paid, &invoice.currency),
            subtotal: minor_to_decimal(invoice.subtotal, &invoice.currency),
            tax: minor_to_decimal(invoice.tax_amount(), &invoice.currency),
            currency: invoice.currency.clone(),
            invoice_id: invoice.id.clone(),
            subscription_id: subscription_id.to_string(),
            payment_intent_id: invoice.payment_intent.clone(),
            billing_reason: invoice.billing_reason.clone(),
            description: Some("Membership renewal".to_string()),
            created_at: invoice.created,
        });

        match self.ledger.create(&transaction).await {
            Ok(()) => {}
            Err(MembershipError::DuplicateTransaction { .. }) => {
                // Lost a race with a concurrent delivery of the same invoice.
                record_billing_event(EVENT_PAYMENT_SUCCEEDED, "duplicate");
                return match self
                    .existing_transaction(&invoice.id, TransactionKind::SubscriptionRenewal)
                    .await?
                {
                    Some(existing) => self.finish_duplicate(&existing, invoice).await,
                    None => Ok(RenewalOutcome {
                        status: RenewalStatus::Duplicate,
                        ..RenewalOutcome::skipped(&invoice.id)
                    }),
                };
            }
            Err(e) => return Err(e),
        }

        let (membership, billing_enforcement) = match membership {
            Some(membership) => {
                let (updated, enforcement) = self
                    .roll_forward(membership, invoice, &subscription)
                    .await
                    .map_err(|e| {
                        error!(
                            transaction_id = %transaction.id,
                            error = %e,
                            "Renewal recorded but membership not updated; reconcile manually"
                        );
                        e
                    })?;
                (Some(updated), enforcement)
            }
            None => {
                warn!(
                    subscription_id,
                    customer_id = %customer_id,
                    product_id = %product_id,
                    "No active membership for renewed subscription"
                );
                (None, BillingEnforcement::NotApplicable)
            }
        };

        let email = membership
            .as_ref()
            .and_then(|m| m.customer_email.clone())
            .or_else(|| invoice.customer_email.clone());
        let receipt_sent = match email {
            Some(email) => self.send_receipt(&transaction, &email, &org_id).await,
            None => false,
        };

        record_billing_event(EVENT_PAYMENT_SUCCEEDED, "recorded");
        info!(
            transaction_id = %transaction.id,
            amount = %transaction.amount,
            receipt_sent,
            "Renewal recorded"
        );

        Ok(RenewalOutcome {
            status: RenewalStatus::Recorded,
            invoice_id: invoice.id.clone(),
            transaction_id: Some(transaction.id),
            membership_id: membership.map(|m| m.id),
            billing_enforcement,
            receipt_sent,
        })
    }

    /// A renewal already in the ledger. Rolls the membership forward if the
    /// delivery that wrote the ledger entry failed before doing so.
    async fn finish_duplicate(
        &self,
        existing: &Transaction,
        invoice: &Invoice,
    ) -> Result<RenewalOutcome, MembershipError> {
        let mut outcome = RenewalOutcome::duplicate(existing);
        let Some(membership_id) = existing.membership_id.as_deref() else {
            return Ok(outcome);
        };
        let membership = match self.store.find_by_id(membership_id).await? {
            Some(m) if m.status != MembershipStatus::Cancelled => m,
            _ => return Ok(outcome),
        };
        if membership.has_billed_invoice(&invoice.id) {
            return Ok(outcome);
        }

        let subscription = self
            .gateway
            .retrieve_subscription(&existing.subscription_id)
            .await?;
        let (updated, enforcement) = self.roll_forward(membership, invoice, &subscription).await?;
        warn!(
            transaction_id = %existing.id,
            membership_id = %updated.id,
            "Completed renewal left unapplied by an earlier delivery"
        );

        outcome.billing_enforcement = enforcement;
        if let Some(email) = updated
            .customer_email
            .clone()
            .or_else(|| invoice.customer_email.clone())
        {
            outcome.receipt_sent = self.send_receipt(existing, &email, &existing.org_id).await;
        }
        Ok(outcome)
    }

    /// Advance billing dates and enforce the billing limit. Applies at most
    /// once per invoice.
    async fn roll_forward(
        &self,
        membership: Membership,
        invoice: &Invoice,
        subscription: &RemoteSubscription,
    ) -> Result<(Membership, BillingEnforcement), MembershipError> {
        if membership.has_billed_invoice(&invoice.id) {
            return Ok((membership, BillingEnforcement::NotApplicable));
        }

        let limit = membership
            .billing_max
            .filter(|_| membership.has_limited_billing);
        let count = limit.map(|max| (membership.billing_count + 1).min(max));

        // Ask the processor to stop first; the local record follows its answer.
        let mut scheduled: Option<Result<DateTime<Utc>, String>> = None;
        if let (Some(max), Some(count)) = (limit, count) {
            if count >= max && !membership.is_scheduled_for_cancellation() {
                let update = SubscriptionUpdate {
                    cancellation: Some(CancellationUpdate::AtPeriodEnd),
                    ..Default::default()
                };
                scheduled = Some(
                    match self.gateway.update_subscription(&subscription.id, &update).await {
                        Ok(remote) => Ok(remote
                            .scheduled_end()
                            .unwrap_or(remote.current_period_end)),
                        Err(e) => {
                            error!(
                                membership_id = %membership.id,
                                subscription_id = %subscription.id,
                                error = %e,
                                "Billing limit reached but cancellation not scheduled"
                            );
                            Err(e.to_string())
                        }
                    },
                );
            }
        }

        let billed_at = invoice.created;
        let next_billing = subscription.current_period_end;
        let updated = self
            .update_with_retry(&membership.id, |m| {
                if m.has_billed_invoice(&invoice.id) {
                    return;
                }
                m.record_billing(billed_at, next_billing);
                m.mark_invoice_billed(&invoice.id);
                if let Some(max) = limit {
                    m.billing_count = (m.billing_count + 1).min(max);
                }
                if let Some(Ok(at)) = &scheduled {
                    if !m.is_scheduled_for_cancellation() {
                        m.schedule_cancellation(*at, BILLING_LIMIT_REASON, SYSTEM_ACTOR);
                    }
                }
            })
            .await?;

        let enforcement = match (limit, scheduled) {
            (None, _) => BillingEnforcement::NotApplicable,
            (Some(_), Some(Ok(at))) => BillingEnforcement::CancellationScheduled {
                billing_count: updated.billing_count,
                scheduled_for: at,
            },
            (Some(_), Some(Err(error))) => BillingEnforcement::Failed {
                billing_count: updated.billing_count,
                error,
            },
            (Some(max), None) => BillingEnforcement::Counted {
                billing_count: updated.billing_count,
                billing_max: max,
            },
        };

        if let BillingEnforcement::CancellationScheduled { scheduled_for, .. } = &enforcement {
            info!(
                membership_id = %updated.id,
                billing_count = updated.billing_count,
                scheduled_for = %scheduled_for,
                "Billing limit reached, cancellation scheduled"
            );
        }

        Ok((updated, enforcement))
    }

    /// Keep an audit record of a failed automatic charge. Membership state is
    /// left alone; staff recover the payment explicitly.
    #[instrument(skip(self, invoice), fields(invoice_id = %invoice.id))]
    pub async fn process_payment_failed(
        &self,
        invoice: &Invoice,
    ) -> Result<RenewalOutcome, MembershipError> {
        let subscription_id = invoice_subscription(invoice)?;

        if let Some(existing) = self
            .existing_transaction(&invoice.id, TransactionKind::RenewalFailure)
            .await?
        {
            record_billing_event(EVENT_PAYMENT_FAILED, "duplicate");
            return Ok(RenewalOutcome::duplicate(&existing));
        }

        let subscription = self.gateway.retrieve_subscription(subscription_id).await?;
        let (customer_id, org_id, product_id) = required_metadata(&subscription)?;

        let membership_id = self
            .store
            .find_active_or_suspended_by_subscription(subscription_id)
            .await?
            .into_iter()
            .find(|m| m.customer_id == customer_id && m.product_id == product_id)
            .map(|m| m.id);

        let transaction = Transaction::new(NewTransaction {
            kind: TransactionKind::RenewalFailure,
            status: TransactionStatus::Failed,
            org_id,
            customer_id,
            membership_id: membership_id.clone(),
            amount: minor_to_decimal(invoice.amount_due, &invoice.currency),
            subtotal: minor_to_decimal(invoice.subtotal, &invoice.currency),
            tax: minor_to_decimal(invoice.tax_amount(), &invoice.currency),
            currency: invoice.currency.clone(),
            invoice_id: invoice.id.clone(),
            subscription_id: subscription_id.to_string(),
            payment_intent_id: invoice.payment_intent.clone(),
            billing_reason: invoice.billing_reason.clone(),
            description: Some("Automatic renewal charge failed".to_string()),
            created_at: invoice.created,
        });

        match self.ledger.create(&transaction).await {
            Ok(()) | Err(MembershipError::DuplicateTransaction { .. }) => {}
            Err(e) => return Err(e),
        }

        warn!(
            subscription_id,
            membership_id = ?membership_id,
            amount_due = invoice.amount_due,
            "Renewal payment failed"
        );
        record_billing_event(EVENT_PAYMENT_FAILED, "recorded");

        Ok(RenewalOutcome {
            status: RenewalStatus::Recorded,
            invoice_id: invoice.id.clone(),
            transaction_id: Some(transaction.id),
            membership_id,
            billing_enforcement: BillingEnforcement::NotApplicable,
            receipt_sent: false,
        })
    }

    /// The processor ended a subscription. Only audited here.
    pub fn process_subscription_deleted(&self, subscription: &RemoteSubscription) {
        info!(
            subscription_id = %subscription.id,
            customer = %subscription.customer,
            org_id = ?subscription.metadata.get("org_id"),
            membership_id = ?subscription.metadata.get("membership_id"),
            "Subscription ended by payment processor"
        );
        record_billing_event(EVENT_SUBSCRIPTION_DELETED, "recorded");
    }

    async fn existing_transaction(
        &self,
        invoice_id: &str,
        kind: TransactionKind,
    ) -> Result<Option<Transaction>, MembershipError> {
        Ok(self
            .ledger
            .find_by_invoice_id(invoice_id)
            .await?
            .into_iter()
            .find(|t| t.kind() == kind))
    }

    /// Best-effort receipt. Failures never affect the caller.
    pub(super) async fn send_receipt(&self, transaction: &Transaction, email: &str, org_id: &str) -> bool {
        match self.receipts.send_receipt(transaction, email, org_id).await {
            Ok(()) => {
                record_receipt("sent");
                true
            }
            Err(e) => {
                warn!(transaction_id = %transaction.id, error = %e, "Receipt not sent");
                record_receipt("failed");
                false
            }
        }
    }
}

fn parse_object<T: serde::de::DeserializeOwned>(event: &BillingEvent) -> Result<T, MembershipError> {
    serde_json::from_value(event.data.object.clone()).map_err(|e| {
        MembershipError::Validation(format!(
            "Malformed {} payload in event {}: {}",
            event.event_type, event.id, e
        ))
    })
}
