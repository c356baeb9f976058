//! Wallet endpoints

use super::{error_to_status_code, respond, ApiResponse, ApiState, Caller, PaginatedResponse, PaginationParams};
use crate::broker::WithdrawalRequest;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use tracing::info;

/// Caller's wallet; created with zero balances on first read
pub async fn get_wallet(State(state): State<ApiState>, Caller(caller): Caller) -> impl IntoResponse {
    respond(state.app.broker.get_wallet(&caller).await)
}

/// Caller's ledger rows, newest first
pub async fn list_transactions(
    State(state): State<ApiState>,
    Caller(caller): Caller,
    Query(params): Query<PaginationParams>,
) -> impl IntoResponse {
    match state
        .app
        .broker
        .list_transactions(&caller, params.page, params.per_page)
        .await
    {
        Ok(page) => (
            StatusCode::OK,
            Json(ApiResponse::success(PaginatedResponse::new(
                page.items,
                page.total,
                page.page,
                page.per_page,
            ))),
        ),
        Err(e) => (error_to_status_code(&e), Json(ApiResponse::error(e.to_string()))),
    }
}

/// Provider withdraws part of the withdrawable balance
pub async fn request_withdrawal(
    State(state): State<ApiState>,
    Caller(caller): Caller,
    Json(req): Json<WithdrawalRequest>,
) -> impl IntoResponse {
    info!("API: Withdrawal request from {}, amount={}", caller, req.amount);
    respond(state.app.broker.request_withdrawal(&caller, req).await)
}

#[cfg(test)]
mod tests {
    use crate::api::testapp::TestApp;
    use crate::db::Role;
    use axum::http::StatusCode;
    use serde_json::json;

    #[tokio::test]
    async fn test_transactions_are_paginated() {
        let app = TestApp::new().await;
        for _ in 0..3 {
            app.fund("u1", 1_000).await;
        }
        let (status, body) = app
            .call("GET", "/v1/wallet/transactions?page=2&per_page=2", Some("u1"), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["total"], json!(3));
        assert_eq!(body["data"]["total_pages"], json!(2));
        assert_eq!(body["data"]["items"].as_array().map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn test_requester_cannot_withdraw() {
        let app = TestApp::new().await;
        app.user("r1", Role::Requester, true).await;
        let (status, _) = app
            .call(
                "POST",
                "/v1/wallet/withdrawals",
                Some("r1"),
                Some(json!({"amount": 10000, "phone": "0712345678"})),
            )
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(app.push.payouts.lock().unwrap().is_empty());
    }
}
