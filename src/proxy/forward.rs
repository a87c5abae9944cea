//! Upstream request rewriting and forwarding.

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::error;

use crate::clients;
use crate::redact::{RateSampler, redact_str};
use crate::transport::TransportError;

use super::context::ProxyContext;

/// Cap on request bodies buffered for form inspection.
pub const MAX_BUFFERED_BODY: usize = 10 * 1024 * 1024;

/// Downstream client identity header set on every forwarded request.
pub const CLIENT_HEADER: &str = "x-qui-client";

/// Upstream failures are frequent when an instance is down; sample the
/// ERROR line so a polling downstream tool cannot flood the log.
static UPSTREAM_ERROR_SAMPLER: RateSampler = RateSampler::new(100);

/// Headers that must not cross the proxy boundary in either direction.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.contains(&name.to_ascii_lowercase().as_str())
}

/// Build the outgoing upstream request:
/// scheme/host from the instance URL, path joined onto the instance's base
/// sub-path, cookies materialised from the instance jar, basic auth applied
/// or Authorization dropped, X-Forwarded-* preserved, client name stamped.
pub fn build_upstream_request(
    ctx: &ProxyContext,
    method: Method,
    path: &str,
    query: Option<&str>,
    downstream_headers: &HeaderMap,
    body: reqwest::Body,
) -> reqwest::Request {
    let mut url = clients::instance_url(&ctx.instance_url, path);
    url.set_query(query);

    let mut req = reqwest::Request::new(method, url);
    let headers = req.headers_mut();

    for (name, value) in downstream_headers {
        let lower = name.as_str().to_ascii_lowercase();
        if is_hop_by_hop(&lower)
            || lower == "host"
            || lower == "content-length"
            || lower == "cookie"
            || lower == "authorization"
        {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    if let Some(cookies) = ctx.client.cookie_header() {
        headers.insert(header::COOKIE, cookies);
    }

    // Basic auth when configured; otherwise any inbound Authorization has
    // already been dropped above.
    if let Some((user, pass)) = &ctx.basic_auth {
        let token = base64::Engine::encode(
            &base64::engine::general_purpose::STANDARD,
            format!("{user}:{pass}"),
        );
        if let Ok(value) = HeaderValue::from_str(&format!("Basic {token}")) {
            headers.insert(header::AUTHORIZATION, value);
        }
    }

    if let Ok(value) = HeaderValue::from_str(&ctx.client_name) {
        headers.insert(CLIENT_HEADER, value);
    }

    *req.body_mut() = Some(body);
    req
}

/// Forward a request and stream the upstream response straight through.
pub async fn passthrough(
    ctx: &ProxyContext,
    method: Method,
    path: &str,
    query: Option<&str>,
    headers: &HeaderMap,
    body: Body,
) -> Response {
    let upstream = build_upstream_request(
        ctx,
        method,
        path,
        query,
        headers,
        reqwest::Body::wrap_stream(body.into_data_stream()),
    );
    match ctx.client.execute(upstream).await {
        Ok(resp) => into_response(resp),
        Err(err) => upstream_error_response(ctx, &err),
    }
}

/// Forward a request whose body was already buffered for inspection. The
/// bytes are forwarded verbatim.
pub async fn forward_buffered(
    ctx: &ProxyContext,
    method: Method,
    path: &str,
    query: Option<&str>,
    headers: &HeaderMap,
    body: bytes::Bytes,
) -> Result<reqwest::Response, Response> {
    let upstream = build_upstream_request(ctx, method, path, query, headers, body.into());
    ctx.client
        .execute(upstream)
        .await
        .map_err(|err| upstream_error_response(ctx, &err))
}

/// Convert an upstream response into a downstream one, streaming the body.
pub fn into_response(resp: reqwest::Response) -> Response {
    let mut builder = Response::builder().status(resp.status());
    if let Some(headers) = builder.headers_mut() {
        copy_response_headers(resp.headers(), headers);
    }
    builder
        .body(Body::from_stream(resp.bytes_stream()))
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
}

/// Same conversion, but with a body that was captured in full.
pub fn into_response_with_body(
    status: StatusCode,
    upstream_headers: &HeaderMap,
    body: bytes::Bytes,
) -> Response {
    let mut builder = Response::builder().status(status);
    if let Some(headers) = builder.headers_mut() {
        copy_response_headers(upstream_headers, headers);
        headers.remove(header::CONTENT_LENGTH);
    }
    builder
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
}

fn copy_response_headers(from: &HeaderMap, to: &mut HeaderMap) {
    for (name, value) in from {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        to.append(name.clone(), value.clone());
    }
}

/// The uniform upstream-failure body.
pub fn upstream_error_response(ctx: &ProxyContext, err: &TransportError) -> Response {
    if UPSTREAM_ERROR_SAMPLER.should_log() {
        error!(
            instance_id = ctx.instance_id,
            error = %redact_str(&err.to_string()),
            "upstream request failed"
        );
    }
    (
        StatusCode::BAD_GATEWAY,
        axum::Json(json!({"error": "Failed to connect to qBittorrent instance"})),
    )
        .into_response()
}
