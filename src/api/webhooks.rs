//! Rail webhook receivers
//!
//! Rails retry anything that is not a 2xx, so every delivery that cannot
//! change state (malformed, unknown reference, already settled) is still
//! acknowledged with 200. Only a store failure asks for a retry.

use super::{error_to_status_code, ApiResponse, ApiState};
use crate::{
    broker::{verify_signature, RailEvent, WebhookOutcome, WithdrawalEvent},
    BrokerError, BrokerResult,
};
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info, warn};

/// Header carrying the generic rail's HMAC
pub const SIGNATURE_HEADER: &str = "x-webhook-signature";

/// Body returned to the rail
#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub received: bool,
    pub outcome: WebhookOutcome,
}

fn ack(outcome: WebhookOutcome) -> Response {
    (
        StatusCode::OK,
        Json(WebhookAck {
            received: true,
            outcome,
        }),
    )
        .into_response()
}

fn parse_body(rail: &str, body: &[u8]) -> Option<Value> {
    match serde_json::from_slice::<Value>(body) {
        Ok(payload) => Some(payload),
        Err(e) => {
            warn!("Webhook[{}]: body is not JSON: {}", rail, e);
            None
        }
    }
}

fn finish(rail: &str, result: BrokerResult<WebhookOutcome>) -> Response {
    match result {
        Ok(outcome) => {
            info!("Webhook[{}]: acknowledged as {:?}", rail, outcome);
            ack(outcome)
        }
        Err(BrokerError::MalformedWebhook(reason)) => {
            warn!("Webhook[{}]: malformed payload: {}", rail, reason);
            ack(WebhookOutcome::Malformed)
        }
        Err(e) => {
            error!("Webhook[{}]: processing failed: {}", rail, e);
            (
                error_to_status_code(&e),
                Json(ApiResponse::<()>::error(e.to_string())),
            )
                .into_response()
        }
    }
}

async fn reconcile_payment(
    state: &ApiState,
    rail: &str,
    body: &[u8],
    parse: fn(&Value) -> BrokerResult<RailEvent>,
) -> Response {
    let Some(payload) = parse_body(rail, body) else {
        return ack(WebhookOutcome::Malformed);
    };
    let result = match parse(&payload) {
        Ok(event) => state.app.broker.reconcile(event).await,
        Err(e) => Err(e),
    };
    finish(rail, result)
}

/// Mobile-money push confirmation
pub async fn push_webhook(State(state): State<ApiState>, body: Bytes) -> Response {
    reconcile_payment(&state, "push", &body, RailEvent::from_push_payload).await
}

/// On-chain deposit confirmation
pub async fn onchain_webhook(State(state): State<ApiState>, body: Bytes) -> Response {
    reconcile_payment(&state, "onchain", &body, RailEvent::from_onchain_payload).await
}

/// `{reference, status}` from any other rail; signed when a secret is configured
pub async fn generic_webhook(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Some(secret) = state.app.config.webhooks.generic_secret.as_deref() {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !verify_signature(secret, &body, signature) {
            warn!("Webhook[generic]: signature check failed");
            return (
                StatusCode::UNAUTHORIZED,
                Json(ApiResponse::<()>::error("Invalid signature")),
            )
                .into_response();
        }
    }
    reconcile_payment(&state, "generic", &body, RailEvent::from_generic_payload).await
}

/// Payout result for a withdrawal
pub async fn withdrawal_webhook(State(state): State<ApiState>, body: Bytes) -> Response {
    let Some(payload) = parse_body("withdrawal", &body) else {
        return ack(WebhookOutcome::Malformed);
    };
    let result = match WithdrawalEvent::from_payload(&payload) {
        Ok(event) => state.app.broker.reconcile_withdrawal(event).await,
        Err(e) => Err(e),
    };
    finish("withdrawal", result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testapp::TestApp;
    use crate::config::Config;
    use crate::db::Role;
    use axum::body::Body;
    use axum::http::Request;
    use hmac::{Hmac, Mac};
    use serde_json::json;
    use sha2::Sha256;

    async fn pending_onchain(app: &TestApp) -> (String, String) {
        app.user("r1", Role::Requester, true).await;
        app.user("p1", Role::Provider, true).await;
        let (_, body) = app
            .call(
                "POST",
                "/v1/settlements/onchain",
                Some("r1"),
                Some(json!({
                    "provider_id": "p1",
                    "kind": "CHAT",
                    "amount": 170000,
                    "idempotency_key": "dep-1"
                })),
            )
            .await;
        let payment_id = body["data"]["payment_id"].as_str().unwrap().to_string();
        let (_, body) = app
            .call("GET", &format!("/v1/payments/{}", payment_id), Some("r1"), None)
            .await;
        let reference = body["data"]["provider_ref"].as_str().unwrap().to_string();
        (payment_id, reference)
    }

    fn raw(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_onchain_webhook_is_idempotent() {
        let app = TestApp::new().await;
        let (payment_id, reference) = pending_onchain(&app).await;
        let payload = json!({"merchant_deposit_id": reference, "status": "completed"});

        let (status, body) = app
            .call("POST", "/v1/webhooks/onchain", None, Some(payload.clone()))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"received": true, "outcome": "completed"}));

        let (status, body) = app
            .call("POST", "/v1/webhooks/onchain", None, Some(payload))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], json!("already_final"));

        let (_, body) = app
            .call("GET", &format!("/v1/payments/{}", payment_id), Some("r1"), None)
            .await;
        assert_eq!(body["data"]["status"], json!("COMPLETED"));
    }

    #[tokio::test]
    async fn test_bad_payloads_are_acknowledged() {
        let app = TestApp::new().await;

        let (status, body) = app.send(raw("/v1/webhooks/push", "not json")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], json!("malformed"));

        let (status, body) = app
            .call("POST", "/v1/webhooks/push", None, Some(json!({"status": "COMPLETED"})))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], json!("malformed"));

        let (status, body) = app
            .call(
                "POST",
                "/v1/webhooks/push",
                None,
                Some(json!({"order_id": "nobody", "status": "COMPLETED"})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], json!("unknown_reference"));

        let (status, body) = app
            .call(
                "POST",
                "/v1/webhooks/withdrawal",
                None,
                Some(json!({"order_id": "wd-nobody", "status": "FAILED"})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], json!("unknown_reference"));
    }

    #[tokio::test]
    async fn test_generic_webhook_signature() {
        let mut config = Config::default();
        config.webhooks.generic_secret = Some("s3cret".to_string());
        let app = TestApp::with_config(config).await;
        let (payment_id, _) = pending_onchain(&app).await;
        let body = json!({"reference": payment_id, "status": "FAILED"}).to_string();

        let mut unsigned = raw("/v1/webhooks/generic", &body);
        unsigned
            .headers_mut()
            .insert(SIGNATURE_HEADER, "00ff".parse().unwrap());
        let (status, _) = app.send(unsigned).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let mut mac = Hmac::<Sha256>::new_from_slice(b"s3cret").unwrap();
        mac.update(body.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());
        let mut signed = raw("/v1/webhooks/generic", &body);
        signed
            .headers_mut()
            .insert(SIGNATURE_HEADER, signature.parse().unwrap());
        let (status, body) = app.send(signed).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], json!("failed"));
    }
}
