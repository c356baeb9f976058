//! Identity-verification trigger

use super::{respond, ApiState, Caller};
use axum::{extract::State, response::IntoResponse};
use tracing::info;

/// Mark the caller verified and release their held requests
pub async fn complete_verification(
    State(state): State<ApiState>,
    Caller(caller): Caller,
) -> impl IntoResponse {
    info!("API: Verification completed for {}", caller);
    respond(state.app.broker.complete_verification(&caller).await)
}

#[cfg(test)]
mod tests {
    use crate::api::testapp::TestApp;
    use crate::db::Role;
    use axum::http::StatusCode;
    use serde_json::json;

    #[tokio::test]
    async fn test_held_request_released_over_http() {
        let app = TestApp::new().await;
        app.user("r1", Role::Requester, false).await;
        app.user("p1", Role::Provider, true).await;
        app.fund("r1", 70_000).await;

        let (_, body) = app
            .call(
                "POST",
                "/v1/settlements/wallet",
                Some("r1"),
                Some(json!({
                    "provider_id": "p1",
                    "kind": "VIDEO",
                    "amount": 70000,
                    "idempotency_key": "k1"
                })),
            )
            .await;
        assert_eq!(body["data"]["interaction_status"], json!("PENDING_VERIFICATION"));

        let (status, body) = app.call("POST", "/v1/verification/complete", Some("r1"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"], json!({"released": 1, "refunded": 0}));
    }
}
