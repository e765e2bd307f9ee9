use crate::engine::{verify_signature, SIGNATURE_HEADER};
use crate::error::MembershipError;
use crate::models::BillingEvent;
use crate::startup::AppState;
use axum::{body::Bytes, extract::State, http::HeaderMap, response::IntoResponse, Json};
use chrono::Utc;
use secrecy::ExposeSecret;
use service_core::error::AppError;

/// Signed event delivery from the payment processor.
pub async fn receive_billing_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| MembershipError::InvalidSignature("missing signature header".to_string()))?;

    verify_signature(
        signature,
        &body,
        state.webhook.secret.expose_secret(),
        state.webhook.tolerance_secs,
        Utc::now(),
    )
    .map_err(|e| {
        tracing::warn!(error = %e, "Rejected billing webhook");
        e
    })?;

    let event: BillingEvent = serde_json::from_slice(&body)
        .map_err(|e| AppError::BadRequest(anyhow::anyhow!("Malformed event: {}", e)))?;

    let outcome = state.engine.handle_event(event).await?;
    Ok(Json(outcome))
}
