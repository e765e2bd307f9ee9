//! Errors raised by the membership engine.

use service_core::error::AppError;
use thiserror::Error;

use crate::services::gateway::GatewayError;

#[derive(Debug, Error)]
pub enum MembershipError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Payment processor error: {0}")]
    ExternalGateway(#[from] GatewayError),

    #[error("Subscription {subscription_id} is missing required metadata: {missing}")]
    MissingMetadata {
        subscription_id: String,
        missing: String,
    },

    #[error("No outstanding invoice for subscription {0}")]
    NoOutstandingInvoice(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Membership {0} was modified concurrently")]
    ConcurrentModification(String),

    #[error("Transaction for invoice {invoice_id} already recorded")]
    DuplicateTransaction { invoice_id: String },

    #[error("Invalid webhook signature: {0}")]
    InvalidSignature(String),

    #[error("Database error: {0}")]
    Database(anyhow::Error),
}

impl MembershipError {
    pub fn membership_not_found(id: &str) -> Self {
        MembershipError::NotFound {
            entity: "Membership",
            id: id.to_string(),
        }
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            MembershipError::NotFound { .. } => "not_found",
            MembershipError::InvalidState(_) => "invalid_state",
            MembershipError::ExternalGateway(_) => "gateway",
            MembershipError::MissingMetadata { .. } => "missing_metadata",
            MembershipError::NoOutstandingInvoice(_) => "no_outstanding_invoice",
            MembershipError::Validation(_) => "validation",
            MembershipError::ConcurrentModification(_) => "concurrent_modification",
            MembershipError::DuplicateTransaction { .. } => "duplicate_transaction",
            MembershipError::InvalidSignature(_) => "invalid_signature",
            MembershipError::Database(_) => "database",
        }
    }
}

impl From<mongodb::error::Error> for MembershipError {
    fn from(err: mongodb::error::Error) -> Self {
        MembershipError::Database(anyhow::Error::new(err))
    }
}

impl From<MembershipError> for AppError {
    fn from(err: MembershipError) -> Self {
        match err {
            MembershipError::NotFound { .. } => AppError::NotFound(anyhow::anyhow!(err.to_string())),
            MembershipError::InvalidState(_)
            | MembershipError::ConcurrentModification(_)
            | MembershipError::DuplicateTransaction { .. } => {
                AppError::Conflict(anyhow::anyhow!(err.to_string()))
            }
            MembershipError::ExternalGateway(gateway) => AppError::BadGateway {
                message: "The payment processor rejected the request".to_string(),
                code: gateway.code,
                kind: gateway.kind,
            },
            MembershipError::MissingMetadata { .. } | MembershipError::Validation(_) => {
                AppError::Unprocessable(err.to_string())
            }
            MembershipError::NoOutstandingInvoice(_) => {
                AppError::BadRequest(anyhow::anyhow!(err.to_string()))
            }
            MembershipError::InvalidSignature(_) => {
                AppError::Unauthorized(anyhow::anyhow!(err.to_string()))
            }
            MembershipError::Database(e) => AppError::DatabaseError(e),
        }
    }
}
