use crate::engine::{ActivateRequest, CancelRequest, PauseRequest, RecoveryRequest};
use crate::startup::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use service_core::error::AppError;

#[derive(Debug, Deserialize)]
pub struct ReactivateRequest {
    pub employee_id: String,
}

pub async fn create_membership(
    State(state): State<AppState>,
    Json(request): Json<ActivateRequest>,
) -> Result<impl IntoResponse, AppError> {
    let membership = state.engine.activate_membership(request).await?;
    Ok((StatusCode::CREATED, Json(membership)))
}

pub async fn get_membership(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let membership = state.engine.get_membership(&id).await?;
    Ok(Json(membership))
}

pub async fn pause_membership(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<PauseRequest>,
) -> Result<impl IntoResponse, AppError> {
    let outcome = state.engine.pause_membership(&id, request).await?;
    Ok(Json(outcome))
}

pub async fn resume_membership(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let membership = state.engine.resume_membership(&id).await?;
    Ok(Json(membership))
}

pub async fn cancel_membership(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<CancelRequest>,
) -> Result<impl IntoResponse, AppError> {
    let membership = state.engine.cancel_membership(&id, request).await?;
    Ok(Json(membership))
}

pub async fn reactivate_membership(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ReactivateRequest>,
) -> Result<impl IntoResponse, AppError> {
    let membership = state
        .engine
        .reactivate_membership(&id, &request.employee_id)
        .await?;
    Ok(Json(membership))
}

pub async fn recover_payment(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<RecoveryRequest>,
) -> Result<impl IntoResponse, AppError> {
    let outcome = state.engine.recover_payment(&id, request).await?;
    Ok(Json(outcome))
}
