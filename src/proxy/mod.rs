//! Reverse proxy entry point.
//!
//! `<base>/proxy/{client_api_key}/{*path}` — authenticate the downstream
//! key, build the proxy context, then dispatch to an intercept or proxy
//! transparently.

mod context;
mod forward;
mod intercept;

pub use context::{ContextError, ProxyContext};
pub use forward::{CLIENT_HEADER, MAX_BUFFERED_BODY};

use axum::Router;
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use serde_json::json;
use tracing::error;

use crate::app::AppState;
use crate::redact::redact_err;
use crate::stores::StoreError;

pub fn router() -> Router<AppState> {
    Router::new().route("/{client_api_key}/{*path}", any(handle))
}

/// AUTHENTICATE → BUILD_PROXY_CTX → DISPATCH.
#[axum::debug_handler]
async fn handle(
    State(state): State<AppState>,
    Path((client_api_key, path)): Path<(String, String)>,
    req: Request,
) -> Response {
    let key = match state.keys.validate_key(&client_api_key).await {
        Ok(key) => key,
        Err(StoreError::NotFound) => {
            state
                .metrics
                .proxy_requests
                .with_label_values(&["unauthorized"])
                .inc();
            return (StatusCode::UNAUTHORIZED, "Invalid API key").into_response();
        }
        Err(err) => {
            error!(error = %redact_err(&err.into()), "downstream key validation failed");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    state.keys.touch_last_used(&key.key_hash).await;

    let ctx = match ProxyContext::build(&state, &key, req.headers()).await {
        Ok(ctx) => ctx,
        Err(err) => {
            state
                .metrics
                .proxy_requests
                .with_label_values(&["upstream_error"])
                .inc();
            return context_error_response(err);
        }
    };

    let resp = intercept::dispatch(&state, &ctx, &path, req).await;
    let outcome = if resp.status().is_server_error() {
        "upstream_error"
    } else {
        "ok"
    };
    state
        .metrics
        .proxy_requests
        .with_label_values(&[outcome])
        .inc();
    resp
}

fn context_error_response(err: ContextError) -> Response {
    let message = match err {
        ContextError::InstanceNotFound => "Instance is not configured",
        ContextError::InstanceInactive => "Instance is inactive",
        ContextError::InvalidBaseUrl => "Instance base URL is invalid",
        ContextError::Internal(err) => {
            error!(error = %redact_err(&err), "proxy context construction failed");
            "Failed to connect to qBittorrent instance"
        }
    };
    (StatusCode::BAD_GATEWAY, axum::Json(json!({"error": message}))).into_response()
}
