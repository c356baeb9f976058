//! Health check endpoints

use super::{ApiResponse, ApiState};
use axum::{extract::State, response::Json};
use serde::Serialize;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Service status
    pub status: String,
    /// Service version
    pub version: String,
    /// Whether the store answers
    pub database_connected: bool,
}

/// Health check endpoint
pub async fn health_check(State(state): State<ApiState>) -> Json<ApiResponse<HealthResponse>> {
    let database_connected = state.app.db.ping().await;

    let response = HealthResponse {
        status: if database_connected { "healthy" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        database_connected,
    };

    Json(ApiResponse::success(response))
}

#[cfg(test)]
mod tests {
    use crate::api::testapp::TestApp;
    use axum::http::StatusCode;
    use serde_json::json;

    #[tokio::test]
    async fn test_health_reports_store() {
        let app = TestApp::new().await;
        let (status, body) = app.call("GET", "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], json!("healthy"));
        assert_eq!(body["data"]["database_connected"], json!(true));
    }
}
