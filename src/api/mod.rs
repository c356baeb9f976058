//! HTTP API for meetpay
//!
//! This module provides a RESTful API for:
//! - Settling paid requests over the wallet, push-payment and on-chain rails
//! - Accepting, rejecting and completing interaction requests
//! - Wallet reads and withdrawals
//! - Webhook callbacks from the payment rails

use crate::{BrokerError, BrokerResult, MeetpayApp};
use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

mod health;
mod interactions;
mod pricing;
mod referrals;
mod settlements;
mod verification;
mod wallet;
mod webhooks;

pub use health::*;
pub use interactions::*;
pub use pricing::*;
pub use referrals::*;
pub use settlements::*;
pub use verification::*;
pub use wallet::*;
pub use webhooks::*;

/// Header carrying the authenticated user id
pub const USER_HEADER: &str = "x-user-id";

/// API state shared across handlers
#[derive(Clone)]
pub struct ApiState {
    /// The meetpay application
    pub app: MeetpayApp,
}

/// Build the API router
pub fn build_router(app: MeetpayApp) -> Router {
    let state = ApiState { app };

    Router::new()
        // Health check
        .route("/health", get(health_check))
        // Pricing
        .route("/v1/pricing/quote", get(get_price_quote))
        // Settlement endpoints
        .route("/v1/settlements/wallet", post(settle_wallet))
        .route("/v1/settlements/push", post(settle_push))
        .route("/v1/settlements/onchain", post(settle_onchain))
        .route("/v1/payments/:payment_id", get(get_payment))
        // Interaction endpoints
        .route("/v1/interactions/:interaction_id", get(get_interaction))
        .route("/v1/interactions/:interaction_id/accept", post(accept_interaction))
        .route("/v1/interactions/:interaction_id/reject", post(reject_interaction))
        .route("/v1/interactions/:interaction_id/service-done", post(service_done))
        .route(
            "/v1/interactions/:interaction_id/messages",
            get(list_messages).post(post_message),
        )
        // Wallet endpoints
        .route("/v1/wallet", get(get_wallet))
        .route("/v1/wallet/transactions", get(list_transactions))
        .route("/v1/wallet/withdrawals", post(request_withdrawal))
        // Referrals and verification
        .route("/v1/referrals", post(register_referral))
        .route("/v1/verification/complete", post(complete_verification))
        // Rail webhooks
        .route("/v1/webhooks/push", post(push_webhook))
        .route("/v1/webhooks/onchain", post(onchain_webhook))
        .route("/v1/webhooks/generic", post(generic_webhook))
        .route("/v1/webhooks/withdrawal", post(withdrawal_webhook))
        .with_state(state)
}

/// Start the HTTP API server with graceful shutdown
pub async fn serve_with_shutdown(
    app: MeetpayApp,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> anyhow::Result<()> {
    let config = app.config.clone();

    let router = build_router(app).layer(TraceLayer::new_for_http());

    // Add CORS if enabled
    let router = if config.server.enable_cors {
        router.layer(CorsLayer::permissive())
    } else {
        router
    };

    let addr: std::net::SocketAddr = config
        .api_bind_address()
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid bind address: {}", e))?;

    info!("Starting HTTP API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.await;
            info!("Received shutdown signal, stopping API server...");
        })
        .await?;

    info!("API server stopped gracefully");
    Ok(())
}

/// Standard API response wrapper
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    /// Whether the request was successful
    pub success: bool,
    /// Response data (only present if success is true)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    /// Error message (only present if success is false)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    /// Create a successful response
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    /// Create an error response
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Convert BrokerError to HTTP status code
pub fn error_to_status_code(err: &BrokerError) -> StatusCode {
    match err {
        BrokerError::InsufficientBalance => StatusCode::PAYMENT_REQUIRED,
        BrokerError::InvalidStateTransition(_) => StatusCode::CONFLICT,
        BrokerError::NotFound(_) => StatusCode::NOT_FOUND,
        BrokerError::ProviderError(_) => StatusCode::BAD_GATEWAY,
        BrokerError::MalformedWebhook(_) => StatusCode::BAD_REQUEST,
        BrokerError::Unauthorized(_) => StatusCode::FORBIDDEN,
        BrokerError::Validation(_) => StatusCode::BAD_REQUEST,
        BrokerError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        BrokerError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Turn a service result into the response envelope
pub fn respond<T: Serialize>(result: BrokerResult<T>) -> (StatusCode, Json<ApiResponse<T>>) {
    match result {
        Ok(data) => (StatusCode::OK, Json(ApiResponse::success(data))),
        Err(e) => (error_to_status_code(&e), Json(ApiResponse::error(e.to_string()))),
    }
}

/// Authenticated caller, taken from the `x-user-id` header
#[derive(Debug, Clone)]
pub struct Caller(pub String);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = (StatusCode, Json<ApiResponse<()>>);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| Caller(v.to_string()))
            .ok_or_else(|| {
                (
                    StatusCode::UNAUTHORIZED,
                    Json(ApiResponse::error("Missing x-user-id header")),
                )
            })
    }
}

/// Pagination parameters
#[derive(Debug, Deserialize)]
pub struct PaginationParams {
    /// Page number (1-based)
    #[serde(default = "default_page")]
    pub page: u32,
    /// Items per page
    #[serde(default = "default_per_page")]
    pub per_page: u32,
}

fn default_page() -> u32 {
    1
}

fn default_per_page() -> u32 {
    20
}

/// Paginated response
#[derive(Debug, Serialize)]
pub struct PaginatedResponse<T> {
    /// Items for this page
    pub items: Vec<T>,
    /// Total number of items
    pub total: u64,
    /// Current page
    pub page: u32,
    /// Items per page
    pub per_page: u32,
    /// Total pages
    pub total_pages: u32,
}

impl<T> PaginatedResponse<T> {
    /// Create a paginated response
    pub fn new(items: Vec<T>, total: u64, page: u32, per_page: u32) -> Self {
        let total_pages = ((total as f64) / (per_page.max(1) as f64)).ceil() as u32;
        Self {
            items,
            total,
            page,
            per_page,
            total_pages,
        }
    }
}
