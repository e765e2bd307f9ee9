pub mod allowance;
pub mod database;
pub mod gateway;
pub mod memory;
pub mod metrics;
pub mod notification;
pub mod store;

pub use allowance::{SuspensionAllowance, YearlyAllowance};
pub use database::MongoDb;
pub use gateway::{GatewayError, HttpSubscriptionGateway, SubscriptionGateway};
pub use memory::{InMemoryLedger, InMemoryMembershipStore, InMemoryPriceCatalog};
pub use notification::{MockReceiptSender, NotificationError, ReceiptSender, SmtpReceiptSender};
pub use store::{MembershipStore, PriceCatalog, TransactionLedger};
