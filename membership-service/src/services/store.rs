//! Persistence seams used by the engine.

use crate::error::MembershipError;
use crate::models::{Membership, Price, Transaction};
use async_trait::async_trait;

#[async_trait]
pub trait MembershipStore: Send + Sync {
    async fn find_by_id(&self, id: &str) -> Result<Option<Membership>, MembershipError>;

    async fn find_active_or_suspended_by_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Vec<Membership>, MembershipError>;

    async fn insert(&self, membership: &Membership) -> Result<(), MembershipError>;

    /// Write `membership` if the stored version still equals `membership.version`.
    ///
    /// Returns the stored record with its bumped version, or
    /// `ConcurrentModification` when another writer got there first.
    async fn save(&self, membership: &Membership) -> Result<Membership, MembershipError>;

    async fn health_check(&self) -> Result<(), MembershipError>;
}

#[async_trait]
pub trait TransactionLedger: Send + Sync {
    /// Insert a new entry. Fails with `DuplicateTransaction` when an entry of
    /// the same kind already references the invoice.
    async fn create(&self, transaction: &Transaction) -> Result<(), MembershipError>;

    async fn find_by_invoice_id(&self, invoice_id: &str)
        -> Result<Vec<Transaction>, MembershipError>;

    async fn mark_recovered_by(
        &self,
        original_id: &str,
        recovery_id: &str,
    ) -> Result<(), MembershipError>;
}

#[async_trait]
pub trait PriceCatalog: Send + Sync {
    async fn prices_for_product(
        &self,
        org_id: &str,
        product_id: &str,
    ) -> Result<Vec<Price>, MembershipError>;
}
