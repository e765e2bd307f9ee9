//! Membership lifecycle, renewal and recovery workflows.
//!
//! Each workflow lives in its own module as an `impl MembershipEngine` block.
//! The engine owns no state beyond its collaborators; every call reads the
//! membership fresh and writes it back with a version check.

pub mod lifecycle;
pub mod recovery;
pub mod renewal;
pub mod signature;

pub use lifecycle::{ActivateRequest, CancelRequest, PauseOutcome, PauseRequest};
pub use recovery::{RecoveryOutcome, RecoveryRequest};
pub use renewal::{BillingEnforcement, EventOutcome, RenewalOutcome, RenewalStatus};
pub use signature::{sign_payload, verify_signature, SIGNATURE_HEADER};

use crate::error::MembershipError;
use crate::models::Membership;
use crate::services::{
    MembershipStore, PriceCatalog, ReceiptSender, SubscriptionGateway, SuspensionAllowance,
    TransactionLedger,
};
use std::sync::Arc;

/// Employee id recorded for changes the engine makes on its own.
pub const SYSTEM_ACTOR: &str = "system";

pub struct MembershipEngine {
    store: Arc<dyn MembershipStore>,
    ledger: Arc<dyn TransactionLedger>,
    catalog: Arc<dyn PriceCatalog>,
    gateway: Arc<dyn SubscriptionGateway>,
    receipts: Arc<dyn ReceiptSender>,
    allowance: Arc<dyn SuspensionAllowance>,
}

impl MembershipEngine {
    pub fn new(
        store: Arc<dyn MembershipStore>,
        ledger: Arc<dyn TransactionLedger>,
        catalog: Arc<dyn PriceCatalog>,
        gateway: Arc<dyn SubscriptionGateway>,
        receipts: Arc<dyn ReceiptSender>,
        allowance: Arc<dyn SuspensionAllowance>,
    ) -> Self {
        Self {
            store,
            ledger,
            catalog,
            gateway,
            receipts,
            allowance,
        }
    }

    pub async fn get_membership(&self, id: &str) -> Result<Membership, MembershipError> {
        self.store
            .find_by_id(id)
            .await?
            .ok_or_else(|| MembershipError::membership_not_found(id))
    }

    pub async fn health_check(&self) -> Result<(), MembershipError> {
        self.store.health_check().await
    }

    /// Validate and write a modified membership.
    async fn persist(&self, membership: &Membership) -> Result<Membership, MembershipError> {
        membership
            .check_invariants()
            .map_err(MembershipError::InvalidState)?;
        self.store.save(membership).await
    }

    /// Re-read, modify and save a membership, retrying when another writer
    /// saved in between.
    async fn update_with_retry<F>(&self, id: &str, mut apply: F) -> Result<Membership, MembershipError>
    where
        F: FnMut(&mut Membership) + Send,
    {
        let mut attempt = 1;
        loop {
            let mut membership = self.get_membership(id).await?;
            apply(&mut membership);
            match self.persist(&membership).await {
                Err(MembershipError::ConcurrentModification(_)) if attempt < SAVE_ATTEMPTS => {
                    tracing::debug!(membership_id = %id, attempt, "Version conflict, retrying");
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

const SAVE_ATTEMPTS: u32 = 3;

/// Metric outcome label for a workflow result.
fn outcome<T>(result: &Result<T, MembershipError>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(e) => e.kind(),
    }
}

fn subscription_id_of(membership: &Membership) -> Result<&str, MembershipError> {
    membership.subscription_id.as_deref().ok_or_else(|| {
        MembershipError::InvalidState(format!(
            "Membership {} has no billing subscription",
            membership.id
        ))
    })
}
