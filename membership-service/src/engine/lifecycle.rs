//! Staff-initiated lifecycle changes.
//!
//! Activation, cancellation and reactivation change what the processor will
//! charge, so they stop at the first processor error and leave the local
//! record untouched. Pausing is applied locally even when the processor sync
//! fails; the caller gets a warning to follow up on.

use super::{outcome, subscription_id_of, MembershipEngine};
use crate::error::MembershipError;
use crate::models::remote::decimal_to_minor;
use crate::models::{resolve_price, Membership, MembershipStatus, NewMembership, Price, Suspension};
use crate::proration;
use crate::services::gateway::{
    CancellationUpdate, CreateInvoiceItem, CreateSubscription, PauseCollectionUpdate,
    SubscriptionUpdate,
};
use crate::services::metrics::record_lifecycle_operation;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
pub struct ActivateRequest {
    pub org_id: String,
    pub customer_id: String,
    #[serde(default)]
    pub customer_email: Option<String>,
    pub product_id: String,
    pub price: Price,
    /// First billing date. Defaults to the processor's period start.
    #[serde(default)]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub payment_method: Option<String>,
    /// Number of renewals after which the membership ends on its own.
    #[serde(default)]
    pub billing_max: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PauseRequest {
    pub days: u32,
    #[serde(default)]
    pub note: String,
    /// Defaults to today.
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    pub created_by: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PauseOutcome {
    pub membership: Membership,
    pub credit_amount: Decimal,
    pub resume_date: NaiveDate,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CancelRequest {
    pub cancelled_by: String,
    #[serde(default)]
    pub reason: String,
}

fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

impl MembershipEngine {
    /// Create the processor subscription for a completed checkout and record
    /// the membership against it.
    #[instrument(skip(self, request), fields(org_id = %request.org_id, customer_id = %request.customer_id))]
    pub async fn activate_membership(
        &self,
        request: ActivateRequest,
    ) -> Result<Membership, MembershipError> {
        let result = self.activate(request).await;
        record_lifecycle_operation("activate", outcome(&result));
        result
    }

    async fn activate(&self, request: ActivateRequest) -> Result<Membership, MembershipError> {
        let price_id = request.price.id.clone().ok_or_else(|| {
            MembershipError::Validation("price has no processor price id".to_string())
        })?;
        if request.price.amount <= Decimal::ZERO {
            return Err(MembershipError::Validation(
                "price amount must be positive".to_string(),
            ));
        }
        if request.billing_max == Some(0) {
            return Err(MembershipError::Validation(
                "billing_max must be at least 1".to_string(),
            ));
        }

        let membership_id = Uuid::new_v4().to_string();
        let metadata = HashMap::from([
            ("customer_id".to_string(), request.customer_id.clone()),
            ("org_id".to_string(), request.org_id.clone()),
            ("product_id".to_string(), request.product_id.clone()),
            ("membership_id".to_string(), membership_id.clone()),
        ]);

        let subscription = self
            .gateway
            .create_subscription(&CreateSubscription {
                customer: request.customer_id.clone(),
                price: price_id,
                billing_cycle_anchor: request.start_date.filter(|start| *start > Utc::now()),
                default_payment_method: request.payment_method.clone(),
                metadata,
            })
            .await?;

        let start_date = request
            .start_date
            .unwrap_or(subscription.current_period_start);
        let membership = Membership {
            id: membership_id,
            ..Membership::new(NewMembership {
                org_id: request.org_id,
                customer_id: request.customer_id,
                customer_email: request.customer_email,
                product_id: request.product_id,
                price: request.price,
                subscription_id: subscription.id.clone(),
                start_date,
                next_billing_date: subscription.current_period_end.max(start_date),
                billing_max: request.billing_max,
            })
        };

        membership
            .check_invariants()
            .map_err(MembershipError::InvalidState)?;
        if let Err(e) = self.store.insert(&membership).await {
            error!(
                subscription_id = %subscription.id,
                membership_id = %membership.id,
                error = %e,
                "Subscription created but membership not stored; reconcile manually"
            );
            return Err(e);
        }

        info!(
            membership_id = %membership.id,
            subscription_id = %subscription.id,
            next_billing_date = %membership.next_billing_date,
            "Membership activated"
        );
        Ok(membership)
    }

    /// Suspend billing for `days`, crediting the unused part of the current
    /// period.
    #[instrument(skip(self, request), fields(days = request.days, created_by = %request.created_by))]
    pub async fn pause_membership(
        &self,
        id: &str,
        request: PauseRequest,
    ) -> Result<PauseOutcome, MembershipError> {
        let result = self.pause(id, request).await;
        record_lifecycle_operation("pause", outcome(&result));
        result
    }

    async fn pause(&self, id: &str, request: PauseRequest) -> Result<PauseOutcome, MembershipError> {
        let mut membership = self.get_membership(id).await?;

        if membership.status != MembershipStatus::Active {
            return Err(MembershipError::InvalidState(format!(
                "Only active memberships can be paused (status: {})",
                membership.status.as_str()
            )));
        }
        if request.days == 0 {
            return Err(MembershipError::Validation(
                "days must be greater than zero".to_string(),
            ));
        }

        let today = Utc::now().date_naive();
        let start = request.start_date.unwrap_or(today);

        let remaining = self.allowance.remaining_days(&membership, start).await?;
        if request.days > remaining {
            return Err(MembershipError::Validation(format!(
                "requested {} days exceeds remaining suspension allowance of {} days",
                request.days, remaining
            )));
        }

        let next_billing = membership.next_billing_date.date_naive();
        let credit = proration::period_suspension_credit(
            membership.price.amount,
            membership.price.billing_frequency,
            request.days,
            start,
            next_billing,
        );
        let resume = proration::resume_date(start, request.days);

        membership.suspensions.push(Suspension {
            start_date: start,
            days: request.days,
            note: request.note,
            credit_amount: credit,
            created_by: request.created_by,
            created_at: Utc::now(),
        });
        if start <= today {
            membership.status = MembershipStatus::Suspended;
        }

        // Recorded locally before the processor is touched, so a failed save
        // never leaves a credit behind that a retry would issue again.
        let membership = self.persist(&membership).await?;

        let warning = match membership.subscription_id.as_deref() {
            Some(subscription_id) => {
                self.sync_pause(&membership, subscription_id, credit, resume, next_billing)
                    .await
            }
            None => None,
        };

        info!(
            membership_id = %membership.id,
            credit_amount = %credit,
            resume_date = %resume,
            status = membership.status.as_str(),
            "Membership paused"
        );

        Ok(PauseOutcome {
            membership,
            credit_amount: credit,
            resume_date: resume,
            warning,
        })
    }

    /// Push a pause to the processor. Returns a warning instead of failing.
    async fn sync_pause(
        &self,
        membership: &Membership,
        subscription_id: &str,
        credit: Decimal,
        resume: NaiveDate,
        next_billing: NaiveDate,
    ) -> Option<String> {
        let mut problems = Vec::new();

        // Invoices falling inside the pause are voided rather than charged.
        if resume > next_billing {
            let update = SubscriptionUpdate {
                pause_collection: Some(PauseCollectionUpdate::VoidUntil(start_of_day(resume))),
                ..Default::default()
            };
            if let Err(e) = self.gateway.update_subscription(subscription_id, &update).await {
                warn!(subscription_id, error = %e, code = ?e.code, "Failed to pause collection");
                problems.push(format!("pause collection not set: {}", e));
            }
        }

        if credit > Decimal::ZERO {
            match decimal_to_minor(credit, &membership.price.currency) {
                Some(minor) => {
                    let item = CreateInvoiceItem {
                        customer: membership.customer_id.clone(),
                        subscription: Some(subscription_id.to_string()),
                        amount: -minor,
                        currency: membership.price.currency.clone(),
                        description: format!("Suspension credit until {}", resume),
                    };
                    if let Err(e) = self.gateway.create_invoice_item(&item).await {
                        warn!(subscription_id, error = %e, code = ?e.code, "Failed to apply suspension credit");
                        problems.push(format!("credit not applied: {}", e));
                    }
                }
                None => problems.push(format!("credit {} out of range", credit)),
            }
        }

        if problems.is_empty() {
            None
        } else {
            Some(format!(
                "Suspension recorded locally but the payment processor was not fully updated: {}",
                problems.join("; ")
            ))
        }
    }

    /// End a suspension early. Billing dates are left as they are.
    #[instrument(skip(self))]
    pub async fn resume_membership(&self, id: &str) -> Result<Membership, MembershipError> {
        let result = self.resume(id).await;
        record_lifecycle_operation("resume", outcome(&result));
        result
    }

    async fn resume(&self, id: &str) -> Result<Membership, MembershipError> {
        let mut membership = self.get_membership(id).await?;

        if membership.status != MembershipStatus::Suspended {
            return Err(MembershipError::InvalidState(format!(
                "Only suspended memberships can be resumed (status: {})",
                membership.status.as_str()
            )));
        }

        membership.status = MembershipStatus::Active;
        let membership = self.persist(&membership).await?;

        if let Some(subscription_id) = membership.subscription_id.as_deref() {
            let update = SubscriptionUpdate {
                pause_collection: Some(PauseCollectionUpdate::Clear),
                ..Default::default()
            };
            if let Err(e) = self.gateway.update_subscription(subscription_id, &update).await {
                warn!(
                    subscription_id,
                    error = %e,
                    code = ?e.code,
                    "Membership resumed but pause collection not cleared"
                );
            }
        }

        info!(membership_id = %membership.id, "Membership resumed");
        Ok(membership)
    }

    /// Schedule the end of a membership, honoring the price's minimum contract.
    #[instrument(skip(self, request), fields(cancelled_by = %request.cancelled_by))]
    pub async fn cancel_membership(
        &self,
        id: &str,
        request: CancelRequest,
    ) -> Result<Membership, MembershipError> {
        let result = self.cancel(id, request).await;
        record_lifecycle_operation("cancel", outcome(&result));
        result
    }

    async fn cancel(&self, id: &str, request: CancelRequest) -> Result<Membership, MembershipError> {
        let mut membership = self.get_membership(id).await?;

        if membership.status != MembershipStatus::Active {
            return Err(MembershipError::InvalidState(format!(
                "Only active memberships can be cancelled (status: {})",
                membership.status.as_str()
            )));
        }
        if membership.is_scheduled_for_cancellation() {
            return Err(MembershipError::InvalidState(
                "Membership is already scheduled for cancellation".to_string(),
            ));
        }
        let subscription_id = subscription_id_of(&membership)?.to_string();

        let price = self.current_price(&membership).await;
        let minimum = proration::minimum_cancellation_date(
            membership.subscription_start_date,
            price.billing_frequency,
            price.min_contract,
        );

        let remote = self.gateway.retrieve_subscription(&subscription_id).await?;
        let cancellation = match minimum {
            Some(min) if min > remote.current_period_end => CancellationUpdate::At(min),
            _ => CancellationUpdate::AtPeriodEnd,
        };

        let updated = self
            .gateway
            .update_subscription(
                &subscription_id,
                &SubscriptionUpdate {
                    cancellation: Some(cancellation),
                    ..Default::default()
                },
            )
            .await?;

        let effective = updated.scheduled_end().unwrap_or(match cancellation {
            CancellationUpdate::At(at) => at,
            _ => updated.current_period_end,
        });

        membership.schedule_cancellation(effective, request.reason, request.cancelled_by);
        let membership = self.persist(&membership).await?;

        info!(
            membership_id = %membership.id,
            subscription_id = %subscription_id,
            scheduled_for = %effective,
            minimum_date = ?minimum,
            "Membership cancellation scheduled"
        );
        Ok(membership)
    }

    /// Price from the catalog, or the membership's own copy when the catalog
    /// no longer lists it.
    async fn current_price(&self, membership: &Membership) -> Price {
        match self
            .catalog
            .prices_for_product(&membership.org_id, &membership.product_id)
            .await
        {
            Ok(prices) => resolve_price(&prices, &membership.price)
                .cloned()
                .unwrap_or_else(|| membership.price.clone()),
            Err(e) => {
                warn!(
                    membership_id = %membership.id,
                    error = %e,
                    "Price catalog unavailable, using membership price"
                );
                membership.price.clone()
            }
        }
    }

    /// Withdraw a scheduled cancellation.
    #[instrument(skip(self))]
    pub async fn reactivate_membership(
        &self,
        id: &str,
        employee_id: &str,
    ) -> Result<Membership, MembershipError> {
        let result = self.reactivate(id, employee_id).await;
        record_lifecycle_operation("reactivate", outcome(&result));
        result
    }

    async fn reactivate(&self, id: &str, employee_id: &str) -> Result<Membership, MembershipError> {
        let mut membership = self.get_membership(id).await?;

        if !membership.is_scheduled_for_cancellation() {
            return Err(MembershipError::InvalidState(
                "Membership is not scheduled for cancellation".to_string(),
            ));
        }
        if membership.status == MembershipStatus::Cancelled {
            return Err(MembershipError::InvalidState(
                "Membership has already ended".to_string(),
            ));
        }

        if let Some(subscription_id) = membership.subscription_id.as_deref() {
            self.gateway
                .update_subscription(
                    subscription_id,
                    &SubscriptionUpdate {
                        cancellation: Some(CancellationUpdate::Clear),
                        ..Default::default()
                    },
                )
                .await?;
        }

        membership.clear_cancellation();
        let membership = self.persist(&membership).await?;

        info!(membership_id = %membership.id, employee_id, "Membership reactivated");
        Ok(membership)
    }
}
