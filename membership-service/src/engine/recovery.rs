//! Staff-driven recovery of a failed automatic renewal charge.
//!
//! The customer pays the outstanding invoice either on a card reader at the
//! front desk or, in test environments, with the processor's test card. The
//! invoice is then settled out of band so the processor stops retrying it.

use super::{outcome, subscription_id_of, MembershipEngine};
use crate::error::MembershipError;
use crate::models::remote::minor_to_decimal;
use crate::models::{
    Invoice, Membership, NewTransaction, PaymentIntent, PaymentMethodRef, Transaction,
    TransactionKind, TransactionStatus,
};
use crate::services::gateway::{
    CreatePaymentIntent, GatewayError, PayInvoice, SubscriptionUpdate, TerminalPayment,
};
use crate::services::metrics::record_recovery;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{error, info, instrument, warn};

/// Processor test token for a card that always succeeds.
pub const TEST_CARD_TOKEN: &str = "tok_visa";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecoveryRequest {
    #[serde(default)]
    pub is_simulation: bool,
    #[serde(default)]
    pub terminal_id: Option<String>,
    #[serde(default)]
    pub recovered_by: Option<String>,
}

impl RecoveryRequest {
    fn path(&self) -> &'static str {
        if self.is_simulation {
            "simulation"
        } else {
            "in_person"
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecoveryOutcome {
    pub membership: Membership,
    pub transaction_id: String,
    pub invoice_id: String,
    pub payment_intent_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub next_billing_date: DateTime<Utc>,
    pub payment_method_updated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

/// A successful charge and the payment method to keep on file, if any.
struct Charge {
    intent: PaymentIntent,
    reusable_method: Option<String>,
    warning: Option<String>,
}

fn latest_open_invoice(invoices: Vec<Invoice>) -> Option<Invoice> {
    invoices.into_iter().max_by_key(|invoice| invoice.created)
}

impl MembershipEngine {
    #[instrument(skip(self, request), fields(path = request.path(), terminal_id = ?request.terminal_id))]
    pub async fn recover_payment(
        &self,
        id: &str,
        request: RecoveryRequest,
    ) -> Result<RecoveryOutcome, MembershipError> {
        let path = request.path();
        let result = self.recover(id, request).await;
        record_recovery(path, outcome(&result));
        result
    }

    async fn recover(
        &self,
        id: &str,
        request: RecoveryRequest,
    ) -> Result<RecoveryOutcome, MembershipError> {
        let membership = self.get_membership(id).await?;
        let subscription_id = subscription_id_of(&membership)?.to_string();

        let terminal_id = match (&request.terminal_id, request.is_simulation) {
            (_, true) => None,
            (Some(terminal), false) if !terminal.trim().is_empty() => Some(terminal.clone()),
            _ => {
                return Err(MembershipError::Validation(
                    "terminal_id is required for in-person recovery".to_string(),
                ))
            }
        };

        let invoices = self.gateway.list_open_invoices(&subscription_id).await?;
        let invoice = latest_open_invoice(invoices)
            .ok_or_else(|| MembershipError::NoOutstandingInvoice(subscription_id.clone()))?;
        if invoice.amount_due <= 0 {
            return Err(MembershipError::Validation(format!(
                "Invoice {} has nothing due",
                invoice.id
            )));
        }

        let metadata = HashMap::from([
            ("invoice_id".to_string(), invoice.id.clone()),
            ("membership_id".to_string(), membership.id.clone()),
            ("subscription_id".to_string(), subscription_id.clone()),
            ("org_id".to_string(), membership.org_id.clone()),
        ]);

        let charge = match terminal_id {
            None => self.charge_test_card(&invoice, metadata).await?,
            Some(reader_id) => self.charge_on_reader(&invoice, &reader_id, metadata).await?,
        };

        if !charge.intent.succeeded() {
            if charge.intent.may_still_settle() {
                error!(
                    payment_intent_id = %charge.intent.id,
                    status = %charge.intent.status,
                    amount = charge.intent.amount,
                    invoice_id = %invoice.id,
                    membership_id = %membership.id,
                    "Charge not confirmed; reconcile the intent if it settles"
                );
            } else {
                warn!(
                    payment_intent_id = %charge.intent.id,
                    status = %charge.intent.status,
                    invoice_id = %invoice.id,
                    "Recovery charge did not succeed"
                );
            }
            return Err(GatewayError::new(format!(
                "Payment {} did not succeed (status: {})",
                charge.intent.id, charge.intent.status
            ))
            .with_code("payment_not_succeeded")
            .with_kind("payment_error")
            .into());
        }

        self.settle(membership, &subscription_id, &invoice, charge, &request)
            .await
    }

    async fn charge_test_card(
        &self,
        invoice: &Invoice,
        metadata: HashMap<String, String>,
    ) -> Result<Charge, MembershipError> {
        let method = self.gateway.create_payment_method(TEST_CARD_TOKEN).await?;
        self.gateway
            .attach_payment_method(&method.id, &invoice.customer)
            .await?;

        let intent = self
            .gateway
            .create_payment_intent(&CreatePaymentIntent {
                amount: invoice.amount_due,
                currency: invoice.currency.clone(),
                customer: invoice.customer.clone(),
                payment_method: method.id.clone(),
                metadata,
            })
            .await?;

        Ok(Charge {
            intent,
            reusable_method: Some(method.id),
            warning: None,
        })
    }

    async fn charge_on_reader(
        &self,
        invoice: &Invoice,
        reader_id: &str,
        metadata: HashMap<String, String>,
    ) -> Result<Charge, MembershipError> {
        let intent = self
            .gateway
            .process_terminal_payment(&TerminalPayment {
                reader_id: reader_id.to_string(),
                amount: invoice.amount_due,
                currency: invoice.currency.clone(),
                customer: invoice.customer.clone(),
                metadata,
            })
            .await?;

        // Card-present methods cannot be charged again off-session.
        let (reusable_method, warning) = match &intent.payment_method {
            Some(PaymentMethodRef::Expanded(method)) if method.is_reusable() => {
                (Some(method.id.clone()), None)
            }
            Some(PaymentMethodRef::Expanded(method)) => (
                None,
                Some(format!(
                    "Payment collected with a {} payment method, which cannot be saved for \
                     future renewals. Ask the customer to update their card on file.",
                    method.kind
                )),
            ),
            _ => (
                None,
                Some(
                    "Payment collected but its payment method could not be saved for future \
                     renewals. Ask the customer to update their card on file."
                        .to_string(),
                ),
            ),
        };

        Ok(Charge {
            intent,
            reusable_method,
            warning,
        })
    }

    /// Book a successful charge against the invoice, the ledger and the
    /// membership. Money has moved by now, so every failure is logged for
    /// manual reconciliation.
    async fn settle(
        &self,
        membership: Membership,
        subscription_id: &str,
        invoice: &Invoice,
        charge: Charge,
        request: &RecoveryRequest,
    ) -> Result<RecoveryOutcome, MembershipError> {
        let intent = &charge.intent;
        let amount = minor_to_decimal(intent.amount, &intent.currency);
        let reconcile = |stage: &str, e: &MembershipError| {
            error!(
                stage,
                invoice_id = %invoice.id,
                payment_intent_id = %intent.id,
                amount = %amount,
                currency = %intent.currency,
                error = %e,
                "Payment captured but recovery incomplete; reconcile manually"
            );
        };

        let mut warning = charge.warning.clone();
        let mut payment_method_updated = false;
        if let Some(method) = &charge.reusable_method {
            let update = SubscriptionUpdate {
                default_payment_method: Some(method.clone()),
                ..Default::default()
            };
            match self.gateway.update_subscription(subscription_id, &update).await {
                Ok(_) => payment_method_updated = true,
                Err(e) => {
                    warn!(subscription_id, error = %e, "Default payment method not updated");
                    warning = Some(format!(
                        "Payment recovered but the card could not be saved for renewals: {}",
                        e
                    ));
                }
            }
        }

        if let Err(e) = self
            .gateway
            .pay_invoice(
                &invoice.id,
                &PayInvoice {
                    paid_out_of_band: true,
                    payment_method: None,
                },
            )
            .await
        {
            let e = MembershipError::from(e);
            reconcile("pay_invoice", &e);
            return Err(e);
        }

        let transaction = Transaction::new(NewTransaction {
            kind: TransactionKind::MembershipRecovery,
            status: TransactionStatus::Succeeded,
            org_id: membership.org_id.clone(),
            customer_id: membership.customer_id.clone(),
            membership_id: Some(membership.id.clone()),
            amount,
            subtotal: minor_to_decimal(invoice.subtotal, &invoice.currency),
            tax: minor_to_decimal(invoice.tax_amount(), &invoice.currency),
            currency: intent.currency.clone(),
            invoice_id: invoice.id.clone(),
            subscription_id: subscription_id.to_string(),
            payment_intent_id: Some(intent.id.clone()),
            billing_reason: invoice.billing_reason.clone(),
            description: Some(format!("Membership payment recovery ({})", request.path())),
            created_at: Utc::now(),
        });
        if let Err(e) = self.ledger.create(&transaction).await {
            reconcile("record_transaction", &e);
            return Err(e);
        }

        self.link_failures(&invoice.id, &transaction.id).await;

        let period = invoice.service_period();
        let membership = match self
            .update_with_retry(&membership.id, |m| m.record_billing(period.start, period.end))
            .await
        {
            Ok(updated) => updated,
            Err(e) => {
                reconcile("update_membership", &e);
                return Err(e);
            }
        };

        if let Some(email) = membership
            .customer_email
            .clone()
            .or_else(|| invoice.customer_email.clone())
        {
            self.send_receipt(&transaction, &email, &membership.org_id)
                .await;
        }

        info!(
            membership_id = %membership.id,
            invoice_id = %invoice.id,
            payment_intent_id = %intent.id,
            transaction_id = %transaction.id,
            amount = %amount,
            recovered_by = ?request.recovered_by,
            payment_method_updated,
            next_billing_date = %membership.next_billing_date,
            "Membership payment recovered"
        );

        Ok(RecoveryOutcome {
            next_billing_date: membership.next_billing_date,
            membership,
            transaction_id: transaction.id,
            invoice_id: invoice.id.clone(),
            payment_intent_id: intent.id.clone(),
            amount,
            currency: intent.currency.clone(),
            payment_method_updated,
            warning,
        })
    }

    /// Point the invoice's failure records at the recovery that settled them.
    async fn link_failures(&self, invoice_id: &str, recovery_id: &str) {
        let failures = match self.ledger.find_by_invoice_id(invoice_id).await {
            Ok(transactions) => transactions,
            Err(e) => {
                warn!(invoice_id, error = %e, "Could not load failure records");
                return;
            }
        };

        for failure in failures.iter().filter(|t| {
            t.kind() == TransactionKind::RenewalFailure && t.recovered_by.is_none()
        }) {
            if let Err(e) = self.ledger.mark_recovered_by(&failure.id, recovery_id).await {
                warn!(transaction_id = %failure.id, error = %e, "Failure record not linked");
            }
        }
    }
}
