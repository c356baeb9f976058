//! Price quotes

use super::{ApiResponse, ApiState};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use crate::pricing::PriceQuote;
use serde::Deserialize;

/// Exactly one of `base` or `client_price`
#[derive(Debug, Deserialize)]
pub struct QuoteParams {
    /// Provider's base price in minor units
    #[serde(default)]
    pub base: Option<i64>,
    /// Requester-visible price in minor units
    #[serde(default)]
    pub client_price: Option<i64>,
}

fn bad_request(message: impl Into<String>) -> (StatusCode, Json<ApiResponse<PriceQuote>>) {
    (StatusCode::BAD_REQUEST, Json(ApiResponse::error(message)))
}

/// Fee breakdown for a base price, or for the base behind a client price
pub async fn get_price_quote(
    State(state): State<ApiState>,
    Query(params): Query<QuoteParams>,
) -> impl IntoResponse {
    let pricing = state.app.broker.pricing();
    let (amount, from_client_price) = match (params.base, params.client_price) {
        (Some(base), None) => (base, false),
        (None, Some(client_price)) => (client_price, true),
        _ => return bad_request("Pass exactly one of base or client_price"),
    };
    if amount <= 0 {
        return bad_request("Amount must be positive");
    }
    if amount > pricing.max_amount() {
        return bad_request(format!("Amount exceeds the maximum of {}", pricing.max_amount()));
    }

    let quote = if from_client_price {
        pricing.quote_client_price(amount)
    } else {
        pricing.quote(amount)
    };
    match quote {
        Ok(quote) => (StatusCode::OK, Json(ApiResponse::success(quote))),
        Err(e) => bad_request(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use crate::api::testapp::TestApp;
    use axum::http::StatusCode;
    use serde_json::json;

    #[tokio::test]
    async fn test_quote_tiers() {
        let app = TestApp::new().await;
        let (status, body) = app.call("GET", "/v1/pricing/quote?base=150000", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body["data"],
            json!({"base": 150000, "fee": 20000, "client_price": 170000, "provider_payout": 142500})
        );

        let (status, _) = app.call("GET", "/v1/pricing/quote?base=0", None, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_quote_from_client_price() {
        let app = TestApp::new().await;
        let (status, body) = app
            .call("GET", "/v1/pricing/quote?client_price=350000", None, None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["base"], 300_000);
        assert_eq!(body["data"]["fee"], 50_000);

        let (status, _) = app
            .call("GET", "/v1/pricing/quote?client_price=230000", None, None)
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = app
            .call("GET", "/v1/pricing/quote?base=1&client_price=20001", None, None)
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_quote_rejects_amounts_above_ceiling() {
        let app = TestApp::new().await;
        let uri = format!("/v1/pricing/quote?base={}", i64::MAX - 10);
        let (status, body) = app.call("GET", &uri, None, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);

        let (status, _) = app
            .call("GET", "/v1/pricing/quote?base=100000001", None, None)
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
