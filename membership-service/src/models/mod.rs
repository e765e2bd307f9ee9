//! Domain models for membership-service.

mod membership;
mod price;
pub mod remote;
mod transaction;

pub use membership::{Membership, MembershipStatus, NewMembership, Suspension};
pub use price::{resolve_price, BillingFrequency, Price};
pub use remote::{
    BillingEvent, Invoice, InvoiceStatus, PaymentIntent, PaymentMethod, PaymentMethodRef,
    RemoteSubscription,
};
pub use transaction::{
    NewTransaction, Transaction, TransactionKind, TransactionMetadata, TransactionStatus,
};
