//! Interaction request endpoints

use super::{respond, ApiState, Caller};
use axum::{
    extract::{Path, State},
    response::{IntoResponse, Json},
};
use serde::Deserialize;
use tracing::info;

/// Chat message body
#[derive(Debug, Deserialize)]
pub struct PostMessageRequest {
    pub body: String,
}

/// Get a request and its chat session
pub async fn get_interaction(
    State(state): State<ApiState>,
    Caller(caller): Caller,
    Path(interaction_id): Path<String>,
) -> impl IntoResponse {
    info!("API: Get interaction: interaction_id={}", interaction_id);
    respond(state.app.broker.get_interaction(&caller, &interaction_id).await)
}

/// Provider accepts a paid request
pub async fn accept_interaction(
    State(state): State<ApiState>,
    Caller(caller): Caller,
    Path(interaction_id): Path<String>,
) -> impl IntoResponse {
    info!("API: Accept interaction {} by {}", interaction_id, caller);
    respond(state.app.broker.accept(&caller, &interaction_id).await)
}

/// Provider rejects a paid request
pub async fn reject_interaction(
    State(state): State<ApiState>,
    Caller(caller): Caller,
    Path(interaction_id): Path<String>,
) -> impl IntoResponse {
    info!("API: Reject interaction {} by {}", interaction_id, caller);
    respond(state.app.broker.reject(&caller, &interaction_id).await)
}

/// Requester confirms the service was delivered
pub async fn service_done(
    State(state): State<ApiState>,
    Caller(caller): Caller,
    Path(interaction_id): Path<String>,
) -> impl IntoResponse {
    info!("API: Service done for {} by {}", interaction_id, caller);
    respond(state.app.broker.service_done(&caller, &interaction_id).await)
}

pub async fn post_message(
    State(state): State<ApiState>,
    Caller(caller): Caller,
    Path(interaction_id): Path<String>,
    Json(req): Json<PostMessageRequest>,
) -> impl IntoResponse {
    respond(
        state
            .app
            .broker
            .post_message(&caller, &interaction_id, &req.body)
            .await,
    )
}

pub async fn list_messages(
    State(state): State<ApiState>,
    Caller(caller): Caller,
    Path(interaction_id): Path<String>,
) -> impl IntoResponse {
    respond(state.app.broker.list_messages(&caller, &interaction_id).await)
}
