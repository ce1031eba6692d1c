use crate::auth::client_key_from_headers;
use crate::error::GatewayError;
use crate::gateway::{Gateway, GatewayResponse, InboundRequest};
use crate::translate::anthropic_types::{ErrorBody, ErrorResponse};
use crate::translate::Dialect;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/v1/chat/completions", post(handle_chat_completions))
        .route("/v1/messages", post(handle_messages))
        .route("/v1/messages/count_tokens", post(handle_count_tokens))
        .route("/v1/models", get(handle_models))
        .route("/v1/aliases", get(handle_aliases))
        .route("/admin/reload", post(handle_reload))
        .route("/health", get(handle_health))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle_chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle_chat(&state, Dialect::OpenAi, headers, body).await
}

async fn handle_messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle_chat(&state, Dialect::Anthropic, headers, body).await
}

async fn handle_chat(state: &AppState, dialect: Dialect, headers: HeaderMap, body: Bytes) -> Response {
    let request = InboundRequest {
        dialect,
        body,
        client_key: client_key_from_headers(&headers),
        headers,
    };

    match state.gateway.handle(request).await {
        Ok(response) => gateway_response(response),
        Err(e) => error_response(&e),
    }
}

async fn handle_count_tokens(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let client_key = client_key_from_headers(&headers);
    match state.gateway.count_tokens(body, client_key.as_deref()).await {
        Ok(response) => gateway_response(response),
        Err(e) => error_response(&e),
    }
}

async fn handle_models(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let client_key = client_key_from_headers(&headers);
    match state.gateway.list_models(client_key.as_deref()).await {
        Ok(models) => Json(serde_json::json!({ "object": "list", "data": models })).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn handle_aliases(State(state): State<Arc<AppState>>) -> Response {
    match state.gateway.list_aliases() {
        Ok(listing) => Json(listing).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn handle_reload(State(state): State<Arc<AppState>>) -> Response {
    match state.gateway.reload() {
        Ok(summary) => Json(summary).into_response(),
        Err(e) => {
            error!(error = %e, "Reload failed; keeping previous configuration");
            error_response(&e)
        }
    }
}

async fn handle_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

fn gateway_response(response: GatewayResponse) -> Response {
    match response {
        GatewayResponse::Json { status, body } => {
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
            (status, Json(body)).into_response()
        }
        GatewayResponse::Stream(stream) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache")
            .body(Body::from_stream(stream))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
    }
}

/// `{"type":"error","error":{...}}` with the status the error maps to.
pub fn error_response(err: &GatewayError) -> Response {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        error!(status = status.as_u16(), error = %err, "Request failed");
    } else {
        warn!(status = status.as_u16(), error = %err, "Request rejected");
    }

    let mut body = ErrorBody::new(err.error_type(), err.to_string());
    if err.is_timeout() {
        body.retry_after = Some(crate::error::RETRY_AFTER_SECS);
    }
    (status, Json(ErrorResponse::from_body(body))).into_response()
}
