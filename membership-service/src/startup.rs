use crate::config::{MembershipConfig, WebhookConfig};
use crate::engine::MembershipEngine;
use crate::handlers;
use crate::services::{
    HttpSubscriptionGateway, MockReceiptSender, MongoDb, ReceiptSender, SmtpReceiptSender,
    YearlyAllowance,
};
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use service_core::error::AppError;
use service_core::middleware::request_id_middleware;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<MembershipEngine>,
    pub webhook: Arc<WebhookConfig>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics_handler))
        .route("/memberships", post(handlers::create_membership))
        .route("/memberships/:id", get(handlers::get_membership))
        .route("/memberships/:id/pause", post(handlers::pause_membership))
        .route("/memberships/:id/resume", post(handlers::resume_membership))
        .route("/memberships/:id/cancel", post(handlers::cancel_membership))
        .route(
            "/memberships/:id/reactivate",
            post(handlers::reactivate_membership),
        )
        .route("/memberships/:id/recover", post(handlers::recover_payment))
        .route("/webhooks/billing", post(handlers::receive_billing_event))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

pub struct Application {
    port: u16,
    server: Box<dyn std::future::Future<Output = std::io::Result<()>> + Send + Unpin>,
}

impl Application {
    pub async fn build(config: MembershipConfig) -> Result<Self, AppError> {
        let MembershipConfig {
            common,
            mongodb,
            gateway,
            webhook,
            suspension_days_per_year,
            smtp,
            ..
        } = config;

        let db = MongoDb::connect(&mongodb.uri, &mongodb.database)
            .await
            .map_err(|e| {
                tracing::error!("Failed to connect to MongoDB: {}", e);
                e
            })?;
        db.initialize_indexes().await.map_err(|e| {
            tracing::error!("Failed to initialize database indexes: {}", e);
            e
        })?;
        let db = Arc::new(db);

        let gateway = HttpSubscriptionGateway::new(gateway).map_err(|e| {
            AppError::ConfigError(anyhow::anyhow!("Failed to build payment processor client: {}", e))
        })?;

        let receipts: Arc<dyn ReceiptSender> = if smtp.enabled {
            Arc::new(SmtpReceiptSender::new(smtp).map_err(|e| {
                AppError::ConfigError(anyhow::anyhow!("Failed to configure SMTP: {}", e))
            })?)
        } else {
            tracing::info!("SMTP disabled, receipts are logged only");
            Arc::new(MockReceiptSender::new())
        };

        let engine = MembershipEngine::new(
            db.clone(),
            db.clone(),
            db,
            Arc::new(gateway),
            receipts,
            Arc::new(YearlyAllowance::new(suspension_days_per_year)),
        );

        let state = AppState {
            engine: Arc::new(engine),
            webhook: Arc::new(webhook),
        };
        let app = build_router(state);

        let addr = SocketAddr::from(([0, 0, 0, 0], common.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!("Failed to bind TCP listener to {}: {}", addr, e);
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!("Listening on {}", port);

        let server = axum::serve(listener, app);

        Ok(Self {
            port,
            server: Box::new(server.into_future()),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        self.server.await
    }
}
