//! Payment receipts.

use crate::config::SmtpConfig;
use crate::models::Transaction;
use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("Receipts not enabled")]
    NotEnabled,

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),

    #[error("Send error: {0}")]
    SendFailed(String),
}

#[async_trait]
pub trait ReceiptSender: Send + Sync {
    async fn send_receipt(
        &self,
        transaction: &Transaction,
        email: &str,
        org_id: &str,
    ) -> Result<(), NotificationError>;
}

fn receipt_subject(transaction: &Transaction) -> String {
    format!(
        "Payment receipt: {} {}",
        transaction.amount,
        transaction.currency.to_uppercase()
    )
}

fn receipt_body(transaction: &Transaction, org_id: &str) -> String {
    let mut body = format!(
        "Thank you for your payment.\n\n\
         Amount: {} {}\n\
         Subtotal: {}\n\
         Tax: {}\n\
         Invoice: {}\n\
         Date: {}\n",
        transaction.amount,
        transaction.currency.to_uppercase(),
        transaction.subtotal,
        transaction.tax,
        transaction.invoice_id,
        transaction.created_at.format("%Y-%m-%d"),
    );
    if let Some(description) = &transaction.metadata.description {
        body.push_str(&format!("Description: {}\n", description));
    }
    body.push_str(&format!("\nReference: {}/{}\n", org_id, transaction.id));
    body
}

pub struct SmtpReceiptSender {
    config: SmtpConfig,
    transport: Option<AsyncSmtpTransport<Tokio1Executor>>,
}

impl SmtpReceiptSender {
    pub fn new(config: SmtpConfig) -> Result<Self, NotificationError> {
        if !config.enabled {
            return Ok(Self {
                config,
                transport: None,
            });
        }

        let creds = Credentials::new(config.user.clone(), config.password.clone());

        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
            .map_err(|e| {
                NotificationError::Configuration(format!("Failed to create SMTP relay: {}", e))
            })?
            .port(config.port)
            .credentials(creds)
            .build();

        Ok(Self {
            config,
            transport: Some(transport),
        })
    }
}

#[async_trait]
impl ReceiptSender for SmtpReceiptSender {
    async fn send_receipt(
        &self,
        transaction: &Transaction,
        email: &str,
        org_id: &str,
    ) -> Result<(), NotificationError> {
        let transport = self.transport.as_ref().ok_or(NotificationError::NotEnabled)?;

        let from: Mailbox = format!("{} <{}>", self.config.from_name, self.config.from_email)
            .parse()
            .map_err(|e| NotificationError::Configuration(format!("Invalid from address: {}", e)))?;
        let to: Mailbox = email
            .parse()
            .map_err(|e| NotificationError::InvalidRecipient(format!("{}: {}", email, e)))?;

        let message = Message::builder()
            .from(from)
            .to(to)
            .subject(receipt_subject(transaction))
            .header(ContentType::TEXT_PLAIN)
            .body(receipt_body(transaction, org_id))
            .map_err(|e| NotificationError::SendFailed(format!("Failed to build message: {}", e)))?;

        transport
            .send(message)
            .await
            .map_err(|e| NotificationError::SendFailed(format!("Failed to send email: {}", e)))?;

        tracing::info!(
            transaction_id = %transaction.id,
            org_id = %org_id,
            "Receipt sent"
        );
        Ok(())
    }
}

/// Counting sender for tests and deployments with SMTP switched off.
#[derive(Default)]
pub struct MockReceiptSender {
    failing: AtomicBool,
    send_count: AtomicU64,
}

impl MockReceiptSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every send fails until switched back.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn send_count(&self) -> u64 {
        self.send_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReceiptSender for MockReceiptSender {
    async fn send_receipt(
        &self,
        transaction: &Transaction,
        email: &str,
        _org_id: &str,
    ) -> Result<(), NotificationError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(NotificationError::SendFailed("mock failure".to_string()));
        }
        self.send_count.fetch_add(1, Ordering::SeqCst);
        tracing::info!(
            transaction_id = %transaction.id,
            to = %email,
            "[MOCK] Receipt would be sent"
        );
        Ok(())
    }
}
