//! Settlement endpoints

use super::{error_to_status_code, respond, ApiResponse, ApiState, Caller};
use crate::broker::SettlementRequest;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use tracing::{info, warn};

/// Settle from the caller's wallet
pub async fn settle_wallet(
    State(state): State<ApiState>,
    Caller(caller): Caller,
    Json(req): Json<SettlementRequest>,
) -> impl IntoResponse {
    info!(
        "API: Wallet settlement from {} to {}, amount={}",
        caller, req.provider_id, req.amount
    );
    respond(state.app.broker.settle_wallet(&caller, req).await)
}

/// Settle through a push prompt on the caller's phone.
///
/// Holds the connection open until the payment settles or the poll
/// deadline passes.
pub async fn settle_push(
    State(state): State<ApiState>,
    Caller(caller): Caller,
    Json(req): Json<SettlementRequest>,
) -> impl IntoResponse {
    info!(
        "API: Push settlement from {} to {}, amount={}",
        caller, req.provider_id, req.amount
    );
    match state.app.broker.settle_push(&caller, req).await {
        Ok(outcome) => {
            info!(
                "API: Push settlement {} finished as {}",
                outcome.payment_id, outcome.payment_status
            );
            (StatusCode::OK, Json(ApiResponse::success(outcome)))
        }
        Err(e) => {
            warn!("API: Push settlement for {} failed: {}", caller, e);
            (error_to_status_code(&e), Json(ApiResponse::error(e.to_string())))
        }
    }
}

/// Settle through an on-chain deposit page
pub async fn settle_onchain(
    State(state): State<ApiState>,
    Caller(caller): Caller,
    Json(req): Json<SettlementRequest>,
) -> impl IntoResponse {
    info!(
        "API: On-chain settlement from {} to {}, amount={}",
        caller, req.provider_id, req.amount
    );
    respond(state.app.broker.settle_onchain(&caller, req).await)
}

/// Get a payment; payer only
pub async fn get_payment(
    State(state): State<ApiState>,
    Caller(caller): Caller,
    Path(payment_id): Path<String>,
) -> impl IntoResponse {
    info!("API: Get payment: payment_id={}", payment_id);
    respond(state.app.broker.get_payment(&caller, &payment_id).await)
}
