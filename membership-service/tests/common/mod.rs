//! Test helpers for membership-service integration tests.
//!
//! The engine runs against the in-memory store, ledger and catalog and a
//! scripted payment processor, so no database or network is needed.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use membership_service::config::WebhookConfig;
use membership_service::engine::MembershipEngine;
use membership_service::error::MembershipError;
use membership_service::models::remote::{InvoiceLine, InvoiceLines, Period};
use membership_service::models::{
    BillingFrequency, Invoice, InvoiceStatus, Membership, NewMembership, PaymentIntent,
    PaymentMethod, PaymentMethodRef, Price, RemoteSubscription,
};
use membership_service::services::gateway::{
    CancellationUpdate, CreateInvoiceItem, CreatePaymentIntent, CreateSubscription, InvoiceItem,
    PauseCollectionUpdate, PayInvoice, SubscriptionUpdate, TerminalPayment,
};
use membership_service::services::{
    GatewayError, InMemoryLedger, InMemoryMembershipStore, InMemoryPriceCatalog,
    MembershipStore, MockReceiptSender, SubscriptionGateway, YearlyAllowance,
};
use membership_service::startup::AppState;
use rust_decimal::Decimal;
use secrecy::Secret;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub const ORG_ID: &str = "org_1";
pub const CUSTOMER_ID: &str = "cus_1";
pub const PRODUCT_ID: &str = "prod_gym";
pub const WEBHOOK_SECRET: &str = "whsec_test";

pub fn utc(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
}

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

pub fn monthly_price(amount: &str, min_contract: Option<u32>) -> Price {
    Price {
        id: Some("price_monthly".to_string()),
        name: "Monthly".to_string(),
        amount: amount.parse().unwrap(),
        currency: "usd".to_string(),
        billing_frequency: BillingFrequency::Monthly,
        min_contract,
    }
}

pub fn subscription_metadata() -> HashMap<String, String> {
    HashMap::from([
        ("customer_id".to_string(), CUSTOMER_ID.to_string()),
        ("org_id".to_string(), ORG_ID.to_string()),
        ("product_id".to_string(), PRODUCT_ID.to_string()),
    ])
}

pub fn remote_subscription(
    id: &str,
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
) -> RemoteSubscription {
    RemoteSubscription {
        id: id.to_string(),
        customer: CUSTOMER_ID.to_string(),
        status: "active".to_string(),
        current_period_start: period_start,
        current_period_end: period_end,
        cancel_at: None,
        cancel_at_period_end: false,
        default_payment_method: None,
        metadata: subscription_metadata(),
    }
}

/// A paid renewal invoice for `subscription_id` covering `period`.
pub fn renewal_invoice(
    id: &str,
    subscription_id: &str,
    created: DateTime<Utc>,
    amount: i64,
    period_end: DateTime<Utc>,
) -> Invoice {
    Invoice {
        id: id.to_string(),
        customer: CUSTOMER_ID.to_string(),
        subscription: Some(subscription_id.to_string()),
        status: InvoiceStatus::Paid,
        billing_reason: Some("subscription_cycle".to_string()),
        amount_due: amount,
        amount_paid: amount,
        subtotal: amount,
        tax: Some(0),
        total: amount,
        currency: "usd".to_string(),
        created,
        period_start: created,
        period_end,
        lines: InvoiceLines {
            data: vec![InvoiceLine {
                period: Period {
                    start: created,
                    end: period_end,
                },
            }],
        },
        payment_intent: Some(format!("pi_{}", id)),
        customer_email: None,
    }
}

/// An unpaid invoice left open after automatic collection failed.
pub fn open_invoice(
    id: &str,
    subscription_id: &str,
    created: DateTime<Utc>,
    amount: i64,
    period: Period,
) -> Invoice {
    Invoice {
        status: InvoiceStatus::Open,
        amount_paid: 0,
        lines: InvoiceLines {
            data: vec![InvoiceLine { period }],
        },
        ..renewal_invoice(id, subscription_id, created, amount, period.end)
    }
}

/// Payment processor double. State lives in memory; any operation can be
/// made to fail.
pub struct FakeGateway {
    subscriptions: Mutex<HashMap<String, RemoteSubscription>>,
    open_invoices: Mutex<HashMap<String, Vec<Invoice>>>,
    failures: Mutex<HashMap<&'static str, GatewayError>>,
    calls: Mutex<Vec<String>>,
    updates: Mutex<Vec<(String, SubscriptionUpdate)>>,
    invoice_items: Mutex<Vec<CreateInvoiceItem>>,
    paid_invoices: Mutex<Vec<(String, PayInvoice)>>,
    terminal_method_kind: Mutex<String>,
    intent_status: Mutex<String>,
    counter: AtomicU64,
}

impl Default for FakeGateway {
    fn default() -> Self {
        Self {
            subscriptions: Mutex::default(),
            open_invoices: Mutex::default(),
            failures: Mutex::default(),
            calls: Mutex::default(),
            updates: Mutex::default(),
            invoice_items: Mutex::default(),
            paid_invoices: Mutex::default(),
            terminal_method_kind: Mutex::new("card_present".to_string()),
            intent_status: Mutex::new("succeeded".to_string()),
            counter: AtomicU64::new(0),
        }
    }
}

impl FakeGateway {
    pub fn add_subscription(&self, subscription: RemoteSubscription) {
        self.subscriptions
            .lock()
            .unwrap()
            .insert(subscription.id.clone(), subscription);
    }

    pub fn subscription(&self, id: &str) -> Option<RemoteSubscription> {
        self.subscriptions.lock().unwrap().get(id).cloned()
    }

    pub fn add_open_invoice(&self, invoice: Invoice) {
        let subscription = invoice.subscription.clone().unwrap_or_default();
        self.open_invoices
            .lock()
            .unwrap()
            .entry(subscription)
            .or_default()
            .push(invoice);
    }

    /// Make every later call to `operation` fail with `error`.
    pub fn fail(&self, operation: &'static str, error: GatewayError) {
        self.failures.lock().unwrap().insert(operation, error);
    }

    pub fn set_terminal_method_kind(&self, kind: &str) {
        *self.terminal_method_kind.lock().unwrap() = kind.to_string();
    }

    pub fn set_intent_status(&self, status: &str) {
        *self.intent_status.lock().unwrap() = status.to_string();
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, operation: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == operation).count()
    }

    pub fn updates(&self) -> Vec<(String, SubscriptionUpdate)> {
        self.updates.lock().unwrap().clone()
    }

    pub fn invoice_items(&self) -> Vec<CreateInvoiceItem> {
        self.invoice_items.lock().unwrap().clone()
    }

    pub fn paid_invoices(&self) -> Vec<(String, PayInvoice)> {
        self.paid_invoices.lock().unwrap().clone()
    }

    fn enter(&self, operation: &'static str) -> Result<(), GatewayError> {
        self.calls.lock().unwrap().push(operation.to_string());
        match self.failures.lock().unwrap().get(operation) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{}_{}", prefix, self.counter.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn missing(id: &str) -> GatewayError {
        GatewayError::new(format!("No such object: {}", id))
            .with_code("resource_missing")
            .with_kind("invalid_request_error")
    }

    fn intent(&self, amount: i64, currency: &str, customer: &str, method: PaymentMethodRef) -> PaymentIntent {
        PaymentIntent {
            id: self.next_id("pi"),
            status: self.intent_status.lock().unwrap().clone(),
            amount,
            currency: currency.to_string(),
            customer: Some(customer.to_string()),
            payment_method: Some(method),
        }
    }
}

#[async_trait]
impl SubscriptionGateway for FakeGateway {
    async fn create_subscription(
        &self,
        params: &CreateSubscription,
    ) -> Result<RemoteSubscription, GatewayError> {
        self.enter("create_subscription")?;
        let start = params.billing_cycle_anchor.unwrap_or_else(Utc::now);
        let subscription = RemoteSubscription {
            id: self.next_id("sub"),
            customer: params.customer.clone(),
            status: "active".to_string(),
            current_period_start: start,
            current_period_end: start + Duration::days(30),
            cancel_at: None,
            cancel_at_period_end: false,
            default_payment_method: params.default_payment_method.clone(),
            metadata: params.metadata.clone(),
        };
        self.add_subscription(subscription.clone());
        Ok(subscription)
    }

    async fn update_subscription(
        &self,
        id: &str,
        update: &SubscriptionUpdate,
    ) -> Result<RemoteSubscription, GatewayError> {
        self.enter("update_subscription")?;
        self.updates
            .lock()
            .unwrap()
            .push((id.to_string(), update.clone()));

        let mut subscriptions = self.subscriptions.lock().unwrap();
        let subscription = subscriptions.get_mut(id).ok_or_else(|| Self::missing(id))?;
        match update.cancellation {
            Some(CancellationUpdate::AtPeriodEnd) => subscription.cancel_at_period_end = true,
            Some(CancellationUpdate::At(at)) => subscription.cancel_at = Some(at),
            Some(CancellationUpdate::Clear) => {
                subscription.cancel_at_period_end = false;
                subscription.cancel_at = None;
            }
            None => {}
        }
        if let Some(PauseCollectionUpdate::Clear) | Some(PauseCollectionUpdate::VoidUntil(_)) =
            update.pause_collection
        {
            subscription.status = "active".to_string();
        }
        if let Some(pm) = &update.default_payment_method {
            subscription.default_payment_method = Some(pm.clone());
        }
        if let Some(metadata) = &update.metadata {
            subscription.metadata.extend(metadata.clone());
        }
        Ok(subscription.clone())
    }

    async fn retrieve_subscription(&self, id: &str) -> Result<RemoteSubscription, GatewayError> {
        self.enter("retrieve_subscription")?;
        self.subscription(id).ok_or_else(|| Self::missing(id))
    }

    async fn list_open_invoices(&self, subscription_id: &str) -> Result<Vec<Invoice>, GatewayError> {
        self.enter("list_open_invoices")?;
        Ok(self
            .open_invoices
            .lock()
            .unwrap()
            .get(subscription_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn retrieve_invoice(&self, id: &str) -> Result<Invoice, GatewayError> {
        self.enter("retrieve_invoice")?;
        self.open_invoices
            .lock()
            .unwrap()
            .values()
            .flatten()
            .find(|i| i.id == id)
            .cloned()
            .ok_or_else(|| Self::missing(id))
    }

    async fn pay_invoice(&self, id: &str, params: &PayInvoice) -> Result<Invoice, GatewayError> {
        self.enter("pay_invoice")?;
        self.paid_invoices
            .lock()
            .unwrap()
            .push((id.to_string(), params.clone()));

        let mut open = self.open_invoices.lock().unwrap();
        for invoices in open.values_mut() {
            if let Some(pos) = invoices.iter().position(|i| i.id == id) {
                let mut invoice = invoices.remove(pos);
                invoice.status = InvoiceStatus::Paid;
                invoice.amount_paid = invoice.amount_due;
                return Ok(invoice);
            }
        }
        Err(Self::missing(id))
    }

    async fn void_invoice(&self, id: &str) -> Result<Invoice, GatewayError> {
        self.enter("void_invoice")?;
        Err(Self::missing(id))
    }

    async fn finalize_invoice(&self, id: &str) -> Result<Invoice, GatewayError> {
        self.enter("finalize_invoice")?;
        Err(Self::missing(id))
    }

    async fn create_invoice_item(
        &self,
        params: &CreateInvoiceItem,
    ) -> Result<InvoiceItem, GatewayError> {
        self.enter("create_invoice_item")?;
        self.invoice_items.lock().unwrap().push(params.clone());
        Ok(InvoiceItem {
            id: self.next_id("ii"),
            amount: params.amount,
            currency: params.currency.clone(),
        })
    }

    async fn create_payment_method(&self, _card_token: &str) -> Result<PaymentMethod, GatewayError> {
        self.enter("create_payment_method")?;
        Ok(PaymentMethod {
            id: self.next_id("pm"),
            kind: "card".to_string(),
            customer: None,
        })
    }

    async fn attach_payment_method(
        &self,
        payment_method_id: &str,
        customer: &str,
    ) -> Result<PaymentMethod, GatewayError> {
        self.enter("attach_payment_method")?;
        Ok(PaymentMethod {
            id: payment_method_id.to_string(),
            kind: "card".to_string(),
            customer: Some(customer.to_string()),
        })
    }

    async fn create_payment_intent(
        &self,
        params: &CreatePaymentIntent,
    ) -> Result<PaymentIntent, GatewayError> {
        self.enter("create_payment_intent")?;
        Ok(self.intent(
            params.amount,
            &params.currency,
            &params.customer,
            PaymentMethodRef::Id(params.payment_method.clone()),
        ))
    }

    async fn process_terminal_payment(
        &self,
        params: &TerminalPayment,
    ) -> Result<PaymentIntent, GatewayError> {
        self.enter("process_terminal_payment")?;
        let method = PaymentMethod {
            id: self.next_id("pm"),
            kind: self.terminal_method_kind.lock().unwrap().clone(),
            customer: None,
        };
        Ok(self.intent(
            params.amount,
            &params.currency,
            &params.customer,
            PaymentMethodRef::Expanded(method),
        ))
    }
}

/// In-memory store whose next few saves can be made to fail.
pub struct FailingSaves {
    inner: Arc<InMemoryMembershipStore>,
    remaining: AtomicU32,
}

impl FailingSaves {
    fn new(inner: Arc<InMemoryMembershipStore>) -> Self {
        Self {
            inner,
            remaining: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl MembershipStore for FailingSaves {
    async fn find_by_id(&self, id: &str) -> Result<Option<Membership>, MembershipError> {
        self.inner.find_by_id(id).await
    }

    async fn find_active_or_suspended_by_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Vec<Membership>, MembershipError> {
        self.inner
            .find_active_or_suspended_by_subscription(subscription_id)
            .await
    }

    async fn insert(&self, membership: &Membership) -> Result<(), MembershipError> {
        self.inner.insert(membership).await
    }

    async fn save(&self, membership: &Membership) -> Result<Membership, MembershipError> {
        let fail = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(MembershipError::Database(anyhow::anyhow!(
                "transient write failure"
            )));
        }
        self.inner.save(membership).await
    }

    async fn health_check(&self) -> Result<(), MembershipError> {
        self.inner.health_check().await
    }
}

/// Engine wired to in-memory collaborators, with handles to inspect them.
pub struct TestHarness {
    pub engine: Arc<MembershipEngine>,
    pub store: Arc<InMemoryMembershipStore>,
    saves: Arc<FailingSaves>,
    pub ledger: Arc<InMemoryLedger>,
    pub catalog: Arc<InMemoryPriceCatalog>,
    pub gateway: Arc<FakeGateway>,
    pub receipts: Arc<MockReceiptSender>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_allowance(60)
    }

    pub fn with_allowance(days_per_year: u32) -> Self {
        let store = Arc::new(InMemoryMembershipStore::new());
        let ledger = Arc::new(InMemoryLedger::new());
        let catalog = Arc::new(InMemoryPriceCatalog::new());
        let gateway = Arc::new(FakeGateway::default());
        let receipts = Arc::new(MockReceiptSender::new());
        let saves = Arc::new(FailingSaves::new(store.clone()));

        let engine = MembershipEngine::new(
            saves.clone(),
            ledger.clone(),
            catalog.clone(),
            gateway.clone(),
            receipts.clone(),
            Arc::new(YearlyAllowance::new(days_per_year)),
        );

        Self {
            engine: Arc::new(engine),
            store,
            saves,
            ledger,
            catalog,
            gateway,
            receipts,
        }
    }

    /// Store an active membership and its processor subscription.
    pub async fn seed_membership(&self, seed: SeedMembership) -> Membership {
        let subscription_id = seed.subscription_id.clone();
        let mut membership = Membership::new(NewMembership {
            org_id: ORG_ID.to_string(),
            customer_id: CUSTOMER_ID.to_string(),
            customer_email: seed.customer_email.clone(),
            product_id: PRODUCT_ID.to_string(),
            price: seed.price.clone(),
            subscription_id: subscription_id.clone(),
            start_date: seed.start_date,
            next_billing_date: seed.next_billing_date,
            billing_max: seed.billing_max,
        });
        membership.last_billing_date = seed.last_billing_date.unwrap_or(seed.start_date);

        self.store.insert(&membership).await.unwrap();
        self.gateway.add_subscription(remote_subscription(
            &subscription_id,
            membership.last_billing_date,
            seed.next_billing_date,
        ));
        membership
    }

    /// Make the engine's next `count` membership saves fail.
    pub fn fail_next_saves(&self, count: u32) {
        self.saves.remaining.store(count, Ordering::SeqCst);
    }

    pub fn stored(&self, id: &str) -> Membership {
        self.store.get(id).expect("membership stored")
    }

    pub fn app_state(&self) -> AppState {
        AppState {
            engine: self.engine.clone(),
            webhook: Arc::new(WebhookConfig {
                secret: Secret::new(WEBHOOK_SECRET.to_string()),
                tolerance_secs: 300,
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SeedMembership {
    pub subscription_id: String,
    pub price: Price,
    pub start_date: DateTime<Utc>,
    pub last_billing_date: Option<DateTime<Utc>>,
    pub next_billing_date: DateTime<Utc>,
    pub billing_max: Option<u32>,
    pub customer_email: Option<String>,
}

impl Default for SeedMembership {
    fn default() -> Self {
        Self {
            subscription_id: "sub_seed".to_string(),
            price: monthly_price("100.00", None),
            start_date: utc(2024, 1, 1),
            last_billing_date: None,
            next_billing_date: utc(2024, 2, 1),
            billing_max: None,
            customer_email: Some("member@example.com".to_string()),
        }
    }
}

pub fn amount(value: &str) -> Decimal {
    value.parse().unwrap()
}
