//! In-process implementations of the persistence seams.
//!
//! They honor the same contracts as the MongoDB implementations (version
//! compare-and-swap, one entry per invoice and kind) and back the integration
//! tests and local runs without a database.

use crate::error::MembershipError;
use crate::models::{Membership, MembershipStatus, Price, Transaction};
use crate::services::store::{MembershipStore, PriceCatalog, TransactionLedger};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Mutex;

#[derive(Default)]
pub struct InMemoryMembershipStore {
    memberships: DashMap<String, Membership>,
}

impl InMemoryMembershipStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current stored copy, bypassing the engine.
    pub fn get(&self, id: &str) -> Option<Membership> {
        self.memberships.get(id).map(|m| m.clone())
    }
}

#[async_trait]
impl MembershipStore for InMemoryMembershipStore {
    async fn find_by_id(&self, id: &str) -> Result<Option<Membership>, MembershipError> {
        Ok(self.get(id))
    }

    async fn find_active_or_suspended_by_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Vec<Membership>, MembershipError> {
        Ok(self
            .memberships
            .iter()
            .filter(|m| {
                m.subscription_id.as_deref() == Some(subscription_id)
                    && matches!(
                        m.status,
                        MembershipStatus::Active | MembershipStatus::Suspended
                    )
            })
            .map(|m| m.clone())
            .collect())
    }

    async fn insert(&self, membership: &Membership) -> Result<(), MembershipError> {
        if self.memberships.contains_key(&membership.id) {
            return Err(MembershipError::Database(anyhow::anyhow!(
                "Membership {} already exists",
                membership.id
            )));
        }
        self.memberships
            .insert(membership.id.clone(), membership.clone());
        Ok(())
    }

    async fn save(&self, membership: &Membership) -> Result<Membership, MembershipError> {
        let mut stored = self
            .memberships
            .get_mut(&membership.id)
            .ok_or_else(|| MembershipError::membership_not_found(&membership.id))?;

        if stored.version != membership.version {
            return Err(MembershipError::ConcurrentModification(
                membership.id.clone(),
            ));
        }

        let mut updated = membership.clone();
        updated.version += 1;
        updated.updated_at = Utc::now();
        *stored = updated.clone();
        Ok(updated)
    }

    async fn health_check(&self) -> Result<(), MembershipError> {
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryLedger {
    transactions: Mutex<Vec<Transaction>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<Transaction> {
        self.transactions
            .lock()
            .map(|txs| txs.clone())
            .unwrap_or_default()
    }
}

fn poisoned() -> MembershipError {
    MembershipError::Database(anyhow::anyhow!("ledger lock poisoned"))
}

#[async_trait]
impl TransactionLedger for InMemoryLedger {
    async fn create(&self, transaction: &Transaction) -> Result<(), MembershipError> {
        let mut txs = self.transactions.lock().map_err(|_| poisoned())?;
        if txs
            .iter()
            .any(|t| t.invoice_id == transaction.invoice_id && t.kind() == transaction.kind())
        {
            return Err(MembershipError::DuplicateTransaction {
                invoice_id: transaction.invoice_id.clone(),
            });
        }
        txs.push(transaction.clone());
        Ok(())
    }

    async fn find_by_invoice_id(
        &self,
        invoice_id: &str,
    ) -> Result<Vec<Transaction>, MembershipError> {
        let txs = self.transactions.lock().map_err(|_| poisoned())?;
        Ok(txs
            .iter()
            .filter(|t| t.invoice_id == invoice_id)
            .cloned()
            .collect())
    }

    async fn mark_recovered_by(
        &self,
        original_id: &str,
        recovery_id: &str,
    ) -> Result<(), MembershipError> {
        let mut txs = self.transactions.lock().map_err(|_| poisoned())?;
        let original = txs
            .iter_mut()
            .find(|t| t.id == original_id)
            .ok_or_else(|| MembershipError::NotFound {
                entity: "Transaction",
                id: original_id.to_string(),
            })?;
        original.recovered_by = Some(recovery_id.to_string());
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryPriceCatalog {
    prices: DashMap<(String, String), Vec<Price>>,
}

impl InMemoryPriceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_prices(&self, org_id: &str, product_id: &str, prices: Vec<Price>) {
        self.prices
            .insert((org_id.to_string(), product_id.to_string()), prices);
    }
}

#[async_trait]
impl PriceCatalog for InMemoryPriceCatalog {
    async fn prices_for_product(
        &self,
        org_id: &str,
        product_id: &str,
    ) -> Result<Vec<Price>, MembershipError> {
        Ok(self
            .prices
            .get(&(org_id.to_string(), product_id.to_string()))
            .map(|p| p.clone())
            .unwrap_or_default())
    }
}
