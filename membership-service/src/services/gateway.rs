//! Payment processor client.
//!
//! The engine talks to the processor only through [`SubscriptionGateway`].
//! [`HttpSubscriptionGateway`] speaks the processor's form-encoded REST API.

use crate::config::GatewayConfig;
use crate::models::{Invoice, PaymentIntent, PaymentMethod, RemoteSubscription};
use crate::services::metrics::record_gateway_call;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method};
use secrecy::ExposeSecret;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Error reported by the processor or by the transport to it.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct GatewayError {
    pub message: String,
    /// Processor error code, e.g. `card_declined`.
    pub code: Option<String>,
    /// Processor error type, e.g. `card_error`.
    pub kind: Option<String>,
    pub status: Option<u16>,
}

impl GatewayError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            kind: None,
            status: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        let code = if err.is_timeout() {
            "timeout"
        } else if err.is_connect() {
            "connection_error"
        } else {
            "transport_error"
        };
        GatewayError {
            message: err.to_string(),
            code: Some(code.to_string()),
            kind: Some("api_connection_error".to_string()),
            status: err.status().map(|s| s.as_u16()),
        }
    }
}

/// Pending-cancellation change on a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancellationUpdate {
    AtPeriodEnd,
    At(DateTime<Utc>),
    Clear,
}

/// Collection pause on a subscription. While paused, invoices are voided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseCollectionUpdate {
    VoidUntil(DateTime<Utc>),
    Clear,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubscriptionUpdate {
    pub cancellation: Option<CancellationUpdate>,
    pub pause_collection: Option<PauseCollectionUpdate>,
    pub default_payment_method: Option<String>,
    pub metadata: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateSubscription {
    pub customer: String,
    pub price: String,
    pub billing_cycle_anchor: Option<DateTime<Utc>>,
    pub default_payment_method: Option<String>,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PayInvoice {
    pub paid_out_of_band: bool,
    pub payment_method: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateInvoiceItem {
    pub customer: String,
    pub subscription: Option<String>,
    /// Minor units; negative for a credit.
    pub amount: i64,
    pub currency: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InvoiceItem {
    pub id: String,
    pub amount: i64,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreatePaymentIntent {
    pub amount: i64,
    pub currency: String,
    pub customer: String,
    pub payment_method: String,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TerminalPayment {
    pub reader_id: String,
    pub amount: i64,
    pub currency: String,
    pub customer: String,
    pub metadata: HashMap<String, String>,
}

#[async_trait]
pub trait SubscriptionGateway: Send + Sync {
    async fn create_subscription(
        &self,
        params: &CreateSubscription,
    ) -> Result<RemoteSubscription, GatewayError>;

    async fn update_subscription(
        &self,
        id: &str,
        update: &SubscriptionUpdate,
    ) -> Result<RemoteSubscription, GatewayError>;

    async fn retrieve_subscription(&self, id: &str) -> Result<RemoteSubscription, GatewayError>;

    async fn list_open_invoices(&self, subscription_id: &str) -> Result<Vec<Invoice>, GatewayError>;

    async fn retrieve_invoice(&self, id: &str) -> Result<Invoice, GatewayError>;

    async fn pay_invoice(&self, id: &str, params: &PayInvoice) -> Result<Invoice, GatewayError>;

    async fn void_invoice(&self, id: &str) -> Result<Invoice, GatewayError>;

    async fn finalize_invoice(&self, id: &str) -> Result<Invoice, GatewayError>;

    async fn create_invoice_item(
        &self,
        params: &CreateInvoiceItem,
    ) -> Result<InvoiceItem, GatewayError>;

    /// Create a card payment method from a card token.
    async fn create_payment_method(&self, card_token: &str) -> Result<PaymentMethod, GatewayError>;

    async fn attach_payment_method(
        &self,
        payment_method_id: &str,
        customer: &str,
    ) -> Result<PaymentMethod, GatewayError>;

    /// Create and confirm a charge off-session.
    async fn create_payment_intent(
        &self,
        params: &CreatePaymentIntent,
    ) -> Result<PaymentIntent, GatewayError>;

    /// Collect a card-present payment on a terminal reader. The returned intent
    /// has its payment method expanded.
    async fn process_terminal_payment(
        &self,
        params: &TerminalPayment,
    ) -> Result<PaymentIntent, GatewayError>;
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    #[serde(rename = "type")]
    kind: Option<String>,
    code: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListResponse<T> {
    data: Vec<T>,
}

type Form = Vec<(String, String)>;

fn push(form: &mut Form, key: &str, value: impl ToString) {
    form.push((key.to_string(), value.to_string()));
}

fn push_metadata(form: &mut Form, metadata: &HashMap<String, String>) {
    let mut keys: Vec<_> = metadata.keys().collect();
    keys.sort();
    for key in keys {
        push(form, &format!("metadata[{}]", key), &metadata[key]);
    }
}

/// Form fields for a subscription update. Empty values unset a field.
pub(crate) fn subscription_update_form(update: &SubscriptionUpdate) -> Form {
    let mut form = Form::new();

    match update.cancellation {
        Some(CancellationUpdate::AtPeriodEnd) => push(&mut form, "cancel_at_period_end", true),
        Some(CancellationUpdate::At(at)) => push(&mut form, "cancel_at", at.timestamp()),
        Some(CancellationUpdate::Clear) => {
            push(&mut form, "cancel_at_period_end", false);
            push(&mut form, "cancel_at", "");
        }
        None => {}
    }

    match update.pause_collection {
        Some(PauseCollectionUpdate::VoidUntil(resumes_at)) => {
            push(&mut form, "pause_collection[behavior]", "void");
            push(&mut form, "pause_collection[resumes_at]", resumes_at.timestamp());
        }
        Some(PauseCollectionUpdate::Clear) => push(&mut form, "pause_collection", ""),
        None => {}
    }

    if let Some(pm) = &update.default_payment_method {
        push(&mut form, "default_payment_method", pm);
    }
    if let Some(metadata) = &update.metadata {
        push_metadata(&mut form, metadata);
    }

    form
}

/// HTTP client for the processor's REST API.
pub struct HttpSubscriptionGateway {
    client: Client,
    config: GatewayConfig,
}

impl HttpSubscriptionGateway {
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { client, config })
    }

    fn is_configured(&self) -> bool {
        !self.config.api_key.expose_secret().is_empty()
    }

    async fn send<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        method: Method,
        path: &str,
        form: Option<&Form>,
        query: &[(&str, &str)],
    ) -> Result<T, GatewayError> {
        if !self.is_configured() {
            return Err(GatewayError::new("Payment processor credentials not configured")
                .with_code("not_configured"));
        }

        let started = Instant::now();
        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), path);

        let mut request = self
            .client
            .request(method, &url)
            .bearer_auth(self.config.api_key.expose_secret())
            .query(query);
        if let Some(form) = form {
            request = request.form(form);
        }

        let result = self.read_response(operation, request.send().await).await;
        record_gateway_call(
            operation,
            if result.is_ok() { "ok" } else { "error" },
            started.elapsed().as_secs_f64(),
        );
        result
    }

    async fn read_response<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        response: Result<reqwest::Response, reqwest::Error>,
    ) -> Result<T, GatewayError> {
        let response = response.map_err(|e| {
            tracing::warn!(operation, error = %e, "Payment processor unreachable");
            GatewayError::from(e)
        })?;

        let status = response.status();
        let body = response.text().await?;

        tracing::debug!(operation, status = %status, "Payment processor response");

        if status.is_success() {
            return serde_json::from_str(&body).map_err(|e| {
                GatewayError::new(format!("Unexpected {} response: {}", operation, e))
                    .with_code("invalid_response")
            });
        }

        let detail = serde_json::from_str::<ApiErrorBody>(&body)
            .map(|b| b.error)
            .unwrap_or(ApiErrorDetail {
                kind: Some("api_error".to_string()),
                code: Some("UNKNOWN".to_string()),
                message: Some(body.clone()),
            });

        tracing::warn!(
            operation,
            status = %status,
            code = ?detail.code,
            kind = ?detail.kind,
            "Payment processor rejected request"
        );

        Err(GatewayError {
            message: detail
                .message
                .unwrap_or_else(|| format!("{} failed with status {}", operation, status)),
            code: detail.code,
            kind: detail.kind,
            status: Some(status.as_u16()),
        })
    }

    async fn retrieve_payment_intent(&self, id: &str) -> Result<PaymentIntent, GatewayError> {
        self.send(
            "retrieve_payment_intent",
            Method::GET,
            &format!("/v1/payment_intents/{}", id),
            None,
            &[("expand[]", "payment_method")],
        )
        .await
    }
}

#[async_trait]
impl SubscriptionGateway for HttpSubscriptionGateway {
    async fn create_subscription(
        &self,
        params: &CreateSubscription,
    ) -> Result<RemoteSubscription, GatewayError> {
        let mut form = Form::new();
        push(&mut form, "customer", &params.customer);
        push(&mut form, "items[0][price]", &params.price);
        if let Some(anchor) = params.billing_cycle_anchor {
            push(&mut form, "billing_cycle_anchor", anchor.timestamp());
        }
        if let Some(pm) = &params.default_payment_method {
            push(&mut form, "default_payment_method", pm);
        }
        push_metadata(&mut form, &params.metadata);

        self.send("create_subscription", Method::POST, "/v1/subscriptions", Some(&form), &[])
            .await
    }

    async fn update_subscription(
        &self,
        id: &str,
        update: &SubscriptionUpdate,
    ) -> Result<RemoteSubscription, GatewayError> {
        let form = subscription_update_form(update);
        self.send(
            "update_subscription",
            Method::POST,
            &format!("/v1/subscriptions/{}", id),
            Some(&form),
            &[],
        )
        .await
    }

    async fn retrieve_subscription(&self, id: &str) -> Result<RemoteSubscription, GatewayError> {
        self.send(
            "retrieve_subscription",
            Method::GET,
            &format!("/v1/subscriptions/{}", id),
            None,
            &[],
        )
        .await
    }

    async fn list_open_invoices(&self, subscription_id: &str) -> Result<Vec<Invoice>, GatewayError> {
        let list: ListResponse<Invoice> = self
            .send(
                "list_open_invoices",
                Method::GET,
                "/v1/invoices",
                None,
                &[("subscription", subscription_id), ("status", "open")],
            )
            .await?;
        Ok(list.data)
    }

    async fn retrieve_invoice(&self, id: &str) -> Result<Invoice, GatewayError> {
        self.send(
            "retrieve_invoice",
            Method::GET,
            &format!("/v1/invoices/{}", id),
            None,
            &[],
        )
        .await
    }

    async fn pay_invoice(&self, id: &str, params: &PayInvoice) -> Result<Invoice, GatewayError> {
        let mut form = Form::new();
        if params.paid_out_of_band {
            push(&mut form, "paid_out_of_band", true);
        }
        if let Some(pm) = &params.payment_method {
            push(&mut form, "payment_method", pm);
        }
        self.send(
            "pay_invoice",
            Method::POST,
            &format!("/v1/invoices/{}/pay", id),
            Some(&form),
            &[],
        )
        .await
    }

    async fn void_invoice(&self, id: &str) -> Result<Invoice, GatewayError> {
        self.send(
            "void_invoice",
            Method::POST,
            &format!("/v1/invoices/{}/void", id),
            Some(&Form::new()),
            &[],
        )
        .await
    }

    async fn finalize_invoice(&self, id: &str) -> Result<Invoice, GatewayError> {
        self.send(
            "finalize_invoice",
            Method::POST,
            &format!("/v1/invoices/{}/finalize", id),
            Some(&Form::new()),
            &[],
        )
        .await
    }

    async fn create_invoice_item(
        &self,
        params: &CreateInvoiceItem,
    ) -> Result<InvoiceItem, GatewayError> {
        let mut form = Form::new();
        push(&mut form, "customer", &params.customer);
        if let Some(subscription) = &params.subscription {
            push(&mut form, "subscription", subscription);
        }
        push(&mut form, "amount", params.amount);
        push(&mut form, "currency", &params.currency);
        push(&mut form, "description", &params.description);

        self.send("create_invoice_item", Method::POST, "/v1/invoiceitems", Some(&form), &[])
            .await
    }

    async fn create_payment_method(&self, card_token: &str) -> Result<PaymentMethod, GatewayError> {
        let mut form = Form::new();
        push(&mut form, "type", "card");
        push(&mut form, "card[token]", card_token);
        self.send("create_payment_method", Method::POST, "/v1/payment_methods", Some(&form), &[])
            .await
    }

    async fn attach_payment_method(
        &self,
        payment_method_id: &str,
        customer: &str,
    ) -> Result<PaymentMethod, GatewayError> {
        let mut form = Form::new();
        push(&mut form, "customer", customer);
        self.send(
            "attach_payment_method",
            Method::POST,
            &format!("/v1/payment_methods/{}/attach", payment_method_id),
            Some(&form),
            &[],
        )
        .await
    }

    async fn create_payment_intent(
        &self,
        params: &CreatePaymentIntent,
    ) -> Result<PaymentIntent, GatewayError> {
        let mut form = Form::new();
        push(&mut form, "amount", params.amount);
        push(&mut form, "currency", &params.currency);
        push(&mut form, "customer", &params.customer);
        push(&mut form, "payment_method", &params.payment_method);
        push(&mut form, "confirm", true);
        push(&mut form, "off_session", true);
        push_metadata(&mut form, &params.metadata);

        self.send("create_payment_intent", Method::POST, "/v1/payment_intents", Some(&form), &[])
            .await
    }

    async fn process_terminal_payment(
        &self,
        params: &TerminalPayment,
    ) -> Result<PaymentIntent, GatewayError> {
        let mut form = Form::new();
        push(&mut form, "amount", params.amount);
        push(&mut form, "currency", &params.currency);
        push(&mut form, "customer", &params.customer);
        push(&mut form, "payment_method_types[]", "card_present");
        push(&mut form, "capture_method", "automatic");
        push_metadata(&mut form, &params.metadata);

        let intent: PaymentIntent = self
            .send("create_payment_intent", Method::POST, "/v1/payment_intents", Some(&form), &[])
            .await?;

        let mut process = Form::new();
        push(&mut process, "payment_intent", &intent.id);
        let _: serde_json::Value = self
            .send(
                "process_payment_intent",
                Method::POST,
                &format!("/v1/terminal/readers/{}/process_payment_intent", params.reader_id),
                Some(&process),
                &[],
            )
            .await?;

        if self.config.simulate_terminal {
            let _: serde_json::Value = self
                .send(
                    "present_payment_method",
                    Method::POST,
                    &format!(
                        "/v1/test_helpers/terminal/readers/{}/present_payment_method",
                        params.reader_id
                    ),
                    Some(&Form::new()),
                    &[],
                )
                .await?;
        }

        let mut latest = self.retrieve_payment_intent(&intent.id).await?;
        for _ in 1..self.config.terminal_poll_attempts {
            if matches!(
                latest.status.as_str(),
                "succeeded" | "canceled" | "requires_payment_method"
            ) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(self.config.terminal_poll_interval_ms)).await;
            latest = self.retrieve_payment_intent(&intent.id).await?;
        }

        tracing::info!(
            payment_intent_id = %latest.id,
            reader_id = %params.reader_id,
            status = %latest.status,
            "Terminal payment finished"
        );

        Ok(latest)
    }
}
