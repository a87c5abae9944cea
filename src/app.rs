//! Application state and HTTP router construction.

use std::sync::Arc;

use axum::Router;
use axum::extract::{Request, State};
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tower_http::trace::TraceLayer;

use crate::api;
use crate::clients::ClientPool;
use crate::config::Config;
use crate::db::Db;
use crate::metrics::Metrics;
use crate::proxy;
use crate::reannounce::ReannounceService;
use crate::stores::{InstanceStore, KeyStore};
use crate::sync::SyncManager;

/// Shared state for all HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db: Arc<Db>,
    pub keys: Arc<KeyStore>,
    pub instances: Arc<InstanceStore>,
    pub pool: Arc<ClientPool>,
    pub sync: Arc<SyncManager>,
    pub reannounce: Arc<ReannounceService>,
    pub metrics: Arc<Metrics>,
}

/// Build the full router: proxy data plane, configuration API, metrics,
/// with the CORS-preflight bypass and request tracing wrapped around
/// everything (the preflight handler answers before authentication).
pub fn build_app(state: AppState) -> Router<()> {
    let base = state.config.base_path.clone();

    Router::new()
        .nest(&format!("{base}/proxy"), proxy::router())
        .nest(&format!("{base}/api"), api::router())
        .route(&format!("{base}/metrics"), get(metrics_handler))
        .layer(middleware::from_fn(cors_preflight))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

/// Answer CORS preflights for anything under the base path, without
/// touching authentication. Repeated preflights are idempotent.
async fn cors_preflight(req: Request, next: Next) -> Response {
    if req.method() != Method::OPTIONS {
        return next.run(req).await;
    }

    let origin = req
        .headers()
        .get(header::ORIGIN)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("*"));
    let requested_headers = req.headers().get(header::ACCESS_CONTROL_REQUEST_HEADERS).cloned();

    let mut resp = StatusCode::NO_CONTENT.into_response();
    let headers = resp.headers_mut();
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
        HeaderValue::from_static("true"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, PUT, DELETE, OPTIONS"),
    );
    if let Some(requested) = requested_headers {
        headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, requested);
    }
    resp
}
