//! MongoDB persistence for memberships, the transaction ledger and the price
//! catalog.

use crate::error::MembershipError;
use crate::models::{Membership, MembershipStatus, Price, Transaction};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::store::{MembershipStore, PriceCatalog, TransactionLedger};
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::TryStreamExt;
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::{
    bson::doc, options::IndexOptions, Client as MongoClient, Collection, Database, IndexModel,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

const DUPLICATE_KEY: i32 = 11000;

/// Product document as written by the catalog screens; only prices are read here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductDocument {
    #[serde(rename = "_id")]
    pub id: String,
    pub org_id: String,
    #[serde(default)]
    pub prices: Vec<Price>,
}

#[derive(Clone)]
pub struct MongoDb {
    client: MongoClient,
    db: Database,
}

impl MongoDb {
    pub async fn connect(uri: &str, database: &str) -> Result<Self, MembershipError> {
        info!(database = %database, "Connecting to MongoDB");
        let client = MongoClient::with_uri_str(uri).await.map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to MongoDB");
            MembershipError::from(e)
        })?;
        let db = client.database(database);
        info!(database = %database, "Successfully connected to MongoDB database");
        Ok(Self { client, db })
    }

    pub fn client(&self) -> &MongoClient {
        &self.client
    }

    fn memberships(&self) -> Collection<Membership> {
        self.db.collection("memberships")
    }

    fn transactions(&self) -> Collection<Transaction> {
        self.db.collection("transactions")
    }

    fn products(&self) -> Collection<ProductDocument> {
        self.db.collection("products")
    }

    pub async fn initialize_indexes(&self) -> Result<(), MembershipError> {
        info!("Creating MongoDB indexes for membership-service");

        let subscription_index = IndexModel::builder()
            .keys(doc! { "subscription_id": 1, "status": 1 })
            .options(
                IndexOptions::builder()
                    .name("subscription_status_lookup".to_string())
                    .build(),
            )
            .build();

        let customer_index = IndexModel::builder()
            .keys(doc! { "org_id": 1, "customer_id": 1 })
            .options(
                IndexOptions::builder()
                    .name("org_customer_lookup".to_string())
                    .build(),
            )
            .build();

        self.memberships()
            .create_indexes([subscription_index, customer_index], None)
            .await?;
        info!("Created indexes on memberships");

        // One ledger entry per invoice and kind; this is what makes renewal
        // processing safe under redelivery races.
        let invoice_index = IndexModel::builder()
            .keys(doc! { "invoice_id": 1, "metadata.type": 1 })
            .options(
                IndexOptions::builder()
                    .name("invoice_kind_unique".to_string())
                    .unique(true)
                    .build(),
            )
            .build();

        self.transactions().create_index(invoice_index, None).await?;
        info!("Created unique index on transactions.(invoice_id, metadata.type)");

        Ok(())
    }
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    matches!(
        &*err.kind,
        ErrorKind::Write(WriteFailure::WriteError(e)) if e.code == DUPLICATE_KEY
    )
}

#[async_trait]
impl MembershipStore for MongoDb {
    #[instrument(skip(self))]
    async fn find_by_id(&self, id: &str) -> Result<Option<Membership>, MembershipError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_membership"])
            .start_timer();

        let membership = self.memberships().find_one(doc! { "_id": id }, None).await?;

        timer.observe_duration();
        Ok(membership)
    }

    #[instrument(skip(self))]
    async fn find_active_or_suspended_by_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Vec<Membership>, MembershipError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_memberships_by_subscription"])
            .start_timer();

        let filter = doc! {
            "subscription_id": subscription_id,
            "status": {
                "$in": [
                    MembershipStatus::Active.as_str(),
                    MembershipStatus::Suspended.as_str(),
                ]
            },
        };
        let memberships: Vec<Membership> = self
            .memberships()
            .find(filter, None)
            .await?
            .try_collect()
            .await?;

        timer.observe_duration();
        Ok(memberships)
    }

    #[instrument(skip(self, membership), fields(membership_id = %membership.id))]
    async fn insert(&self, membership: &Membership) -> Result<(), MembershipError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_membership"])
            .start_timer();

        self.memberships().insert_one(membership, None).await?;

        timer.observe_duration();
        info!(membership_id = %membership.id, "Membership created");
        Ok(())
    }

    #[instrument(skip(self, membership), fields(membership_id = %membership.id, version = membership.version))]
    async fn save(&self, membership: &Membership) -> Result<Membership, MembershipError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["save_membership"])
            .start_timer();

        let mut updated = membership.clone();
        updated.version += 1;
        updated.updated_at = Utc::now();

        let result = self
            .memberships()
            .replace_one(
                doc! { "_id": &membership.id, "version": membership.version },
                &updated,
                None,
            )
            .await?;

        timer.observe_duration();

        if result.matched_count == 0 {
            let exists = self
                .memberships()
                .count_documents(doc! { "_id": &membership.id }, None)
                .await?
                > 0;
            return Err(if exists {
                MembershipError::ConcurrentModification(membership.id.clone())
            } else {
                MembershipError::membership_not_found(&membership.id)
            });
        }

        Ok(updated)
    }

    async fn health_check(&self) -> Result<(), MembershipError> {
        self.db.run_command(doc! { "ping": 1 }, None).await?;
        Ok(())
    }
}

#[async_trait]
impl TransactionLedger for MongoDb {
    #[instrument(skip(self, transaction), fields(invoice_id = %transaction.invoice_id, kind = transaction.kind().as_str()))]
    async fn create(&self, transaction: &Transaction) -> Result<(), MembershipError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_transaction"])
            .start_timer();

        let result = self.transactions().insert_one(transaction, None).await;
        timer.observe_duration();

        match result {
            Ok(_) => {
                info!(transaction_id = %transaction.id, "Transaction recorded");
                Ok(())
            }
            Err(e) if is_duplicate_key(&e) => Err(MembershipError::DuplicateTransaction {
                invoice_id: transaction.invoice_id.clone(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self))]
    async fn find_by_invoice_id(
        &self,
        invoice_id: &str,
    ) -> Result<Vec<Transaction>, MembershipError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_transactions_by_invoice"])
            .start_timer();

        let transactions: Vec<Transaction> = self
            .transactions()
            .find(doc! { "invoice_id": invoice_id }, None)
            .await?
            .try_collect()
            .await?;

        timer.observe_duration();
        Ok(transactions)
    }

    #[instrument(skip(self))]
    async fn mark_recovered_by(
        &self,
        original_id: &str,
        recovery_id: &str,
    ) -> Result<(), MembershipError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["mark_recovered_by"])
            .start_timer();

        let result = self
            .transactions()
            .update_one(
                doc! { "_id": original_id },
                doc! { "$set": { "recovered_by": recovery_id } },
                None,
            )
            .await?;

        timer.observe_duration();

        if result.matched_count == 0 {
            return Err(MembershipError::NotFound {
                entity: "Transaction",
                id: original_id.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl PriceCatalog for MongoDb {
    #[instrument(skip(self))]
    async fn prices_for_product(
        &self,
        org_id: &str,
        product_id: &str,
    ) -> Result<Vec<Price>, MembershipError> {
        let product = self
            .products()
            .find_one(doc! { "_id": product_id, "org_id": org_id }, None)
            .await?;
        Ok(product.map(|p| p.prices).unwrap_or_default())
    }
}
