//! Referral registration

use super::{respond, ApiState, Caller};
use axum::{
    extract::State,
    response::{IntoResponse, Json},
};
use serde::Deserialize;
use tracing::info;

/// Referral registration body
#[derive(Debug, Deserialize)]
pub struct RegisterReferralRequest {
    /// Who referred the caller
    pub referrer_id: String,
}

/// Register the caller as referred by `referrer_id`
pub async fn register_referral(
    State(state): State<ApiState>,
    Caller(caller): Caller,
    Json(req): Json<RegisterReferralRequest>,
) -> impl IntoResponse {
    info!("API: Referral of {} by {}", caller, req.referrer_id);
    respond(
        state
            .app
            .broker
            .register_referral(&caller, &req.referrer_id)
            .await,
    )
}

#[cfg(test)]
mod tests {
    use crate::api::testapp::TestApp;
    use crate::db::Role;
    use axum::http::StatusCode;
    use serde_json::json;

    #[tokio::test]
    async fn test_referral_registered_once() {
        let app = TestApp::new().await;
        app.user("p1", Role::Provider, true).await;
        app.user("ref", Role::Provider, true).await;

        let (status, body) = app
            .call("POST", "/v1/referrals", Some("p1"), Some(json!({"referrer_id": "ref"})))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["referrer_id"], json!("ref"));

        let (status, _) = app
            .call("POST", "/v1/referrals", Some("p1"), Some(json!({"referrer_id": "ref"})))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, body) = app.call("GET", "/v1/wallet", Some("p1"), None).await;
        assert_eq!(body["data"]["withdrawable"], json!(20000));
    }
}
