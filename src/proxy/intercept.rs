//! Intercepted qBittorrent endpoints.
//!
//! A fixed set of paths is handled in-process: ceremonial login, capture
//! endpoints that feed the aggregator, reads served from cached state
//! behind strict query allow-lists, and writes that invalidate per-hash
//! caches after forwarding. Everything else proxies transparently.

use std::time::Duration;

use axum::extract::Request;
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures::FutureExt;
use rand::RngCore;
use serde_json::json;
use tracing::{error, warn};
use url::form_urlencoded;

use crate::app::AppState;
use crate::crypto::hex_encode;
use crate::reannounce::normalise_hashes;
use crate::redact::redact_err;
use crate::sync::TorrentQuery;
use crate::sync::wire::{MainData, TorrentPeers};

use super::context::ProxyContext;
use super::forward::{self, MAX_BUFFERED_BODY};

const INFO_ALLOW: &[&str] = &[
    "filter", "category", "tag", "sort", "reverse", "limit", "offset", "hashes",
];
const SEARCH_ALLOW: &[&str] = &[
    "search", "filter", "category", "tag", "sort", "reverse", "limit", "offset",
];
const HASH_ALLOW: &[&str] = &["hash"];
const FILES_ALLOW: &[&str] = &["hash", "indexes"];

/// Budget for the deferred cache invalidation after a write endpoint.
const INVALIDATION_BUDGET: Duration = Duration::from_secs(30);

pub(super) async fn dispatch(
    state: &AppState,
    ctx: &ProxyContext,
    path: &str,
    req: Request,
) -> Response {
    let path = format!("/{}", path.trim_start_matches('/'));
    let method = req.method().clone();
    match (method.as_str(), path.as_str()) {
        ("POST", "/api/v2/auth/login") => login(state, ctx).await,
        ("GET", "/api/v2/sync/maindata") => capture_maindata(state, ctx, &path, req).await,
        ("GET", "/api/v2/sync/torrentPeers") => {
            capture_torrent_peers(state, ctx, &path, req).await
        }
        ("GET", "/api/v2/torrents/info") => torrents_info(state, ctx, &path, req).await,
        ("GET", "/api/v2/torrents/search") => torrents_search(state, ctx, &path, req).await,
        ("GET", "/api/v2/torrents/categories") => categories(state, ctx, &path, req).await,
        ("GET", "/api/v2/torrents/tags") => tags(state, ctx, &path, req).await,
        ("GET", "/api/v2/torrents/properties") => {
            torrent_detail(state, ctx, &path, req, Detail::Properties).await
        }
        ("GET", "/api/v2/torrents/trackers") => {
            torrent_detail(state, ctx, &path, req, Detail::Trackers).await
        }
        ("GET", "/api/v2/torrents/files") => {
            torrent_detail(state, ctx, &path, req, Detail::Files).await
        }
        (
            "POST",
            "/api/v2/torrents/setLocation"
            | "/api/v2/torrents/renameFile"
            | "/api/v2/torrents/renameFolder"
            | "/api/v2/torrents/delete",
        ) => write_intercept(state, ctx, &path, req).await,
        ("POST", "/api/v2/torrents/reannounce") => reannounce(state, ctx, &path, req).await,
        _ => transparent(ctx, &path, req).await,
    }
}

async fn transparent(ctx: &ProxyContext, path: &str, req: Request) -> Response {
    let (parts, body) = req.into_parts();
    forward::passthrough(
        ctx,
        parts.method,
        path,
        parts.uri.query(),
        &parts.headers,
        body,
    )
    .await
}

/// Ceremonial login: the gateway never forwards downstream credentials.
/// Healthy instance → synthetic session cookie; unhealthy → 502.
async fn login(state: &AppState, ctx: &ProxyContext) -> Response {
    let healthy = state
        .pool
        .check_instance(ctx.instance_id)
        .await
        .unwrap_or(false);
    if !healthy {
        return (
            StatusCode::BAD_GATEWAY,
            axum::Json(json!({"error": "Failed to connect to qBittorrent instance"})),
        )
            .into_response();
    }

    let mut sid = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut sid);
    let mut cookie = format!("SID={}; Path=/; HttpOnly; SameSite=Lax", hex_encode(&sid));
    if ctx.downstream_https {
        cookie.push_str("; Secure");
    }

    let mut resp = (StatusCode::OK, "Ok.").into_response();
    if let Ok(value) = HeaderValue::from_str(&cookie) {
        resp.headers_mut().insert(header::SET_COOKIE, value);
    }
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp
}

/// Forward `sync/maindata`, hand the identical bytes downstream, and merge
/// full snapshots into the aggregator. Incremental updates pass through
/// unmerged.
async fn capture_maindata(
    state: &AppState,
    ctx: &ProxyContext,
    path: &str,
    req: Request,
) -> Response {
    let (parts, _body) = req.into_parts();
    let upstream = forward::build_upstream_request(
        ctx,
        Method::GET,
        path,
        parts.uri.query(),
        &parts.headers,
        reqwest::Body::from(Vec::new()),
    );

    let resp = match ctx.client.execute(upstream).await {
        Ok(resp) => resp,
        Err(err) => return forward::upstream_error_response(ctx, &err),
    };
    let status = resp.status();
    let headers = resp.headers().clone();
    let bytes = match resp.bytes().await {
        Ok(bytes) => bytes,
        Err(err) => return forward::upstream_error_response(ctx, &err.into()),
    };

    if status.is_success() {
        match serde_json::from_slice::<MainData>(&bytes) {
            Ok(md) => {
                if md.full_update || (md.rid == 0 && !md.torrents.is_empty()) {
                    state.sync.apply_main_data(ctx.instance_id, &md);
                }
            }
            Err(err) => {
                warn!(
                    instance_id = ctx.instance_id,
                    error = %err,
                    "unparseable maindata response"
                );
            }
        }
    }

    forward::into_response_with_body(status, &headers, bytes)
}

async fn capture_torrent_peers(
    state: &AppState,
    ctx: &ProxyContext,
    path: &str,
    req: Request,
) -> Response {
    let (parts, _body) = req.into_parts();
    let hash = query_pairs(parts.uri.query())
        .into_iter()
        .find(|(k, _)| k == "hash")
        .map(|(_, v)| v);

    let upstream = forward::build_upstream_request(
        ctx,
        Method::GET,
        path,
        parts.uri.query(),
        &parts.headers,
        reqwest::Body::from(Vec::new()),
    );
    let resp = match ctx.client.execute(upstream).await {
        Ok(resp) => resp,
        Err(err) => return forward::upstream_error_response(ctx, &err),
    };
    let status = resp.status();
    let headers = resp.headers().clone();
    let bytes = match resp.bytes().await {
        Ok(bytes) => bytes,
        Err(err) => return forward::upstream_error_response(ctx, &err.into()),
    };

    if status.is_success() {
        if let (Some(hash), Ok(peers)) = (hash, serde_json::from_slice::<TorrentPeers>(&bytes)) {
            if peers.full_update || (peers.rid == 0 && !peers.peers.is_empty()) {
                state.sync.apply_peers_data(ctx.instance_id, &hash, &peers);
            }
        }
    }

    forward::into_response_with_body(status, &headers, bytes)
}

async fn torrents_info(state: &AppState, ctx: &ProxyContext, path: &str, req: Request) -> Response {
    let params = query_pairs(req.uri().query());
    if !allow_listed(&params, INFO_ALLOW) {
        // Unknown parameter: the aggregator cannot answer faithfully, so
        // the instance does. Never a 400.
        return transparent(ctx, path, req).await;
    }
    let query = build_torrent_query(&params);
    let torrents = state.sync.torrents_with_filters(ctx.instance_id, &query);
    axum::Json(torrents).into_response()
}

async fn torrents_search(
    state: &AppState,
    ctx: &ProxyContext,
    path: &str,
    req: Request,
) -> Response {
    let params = query_pairs(req.uri().query());
    if !allow_listed(&params, SEARCH_ALLOW) {
        return transparent(ctx, path, req).await;
    }
    let query = build_torrent_query(&params);
    let result = state.sync.search_torrents(ctx.instance_id, &query);
    axum::Json(result).into_response()
}

async fn categories(state: &AppState, ctx: &ProxyContext, path: &str, req: Request) -> Response {
    if !query_pairs(req.uri().query()).is_empty() {
        return transparent(ctx, path, req).await;
    }
    axum::Json(state.sync.categories(ctx.instance_id)).into_response()
}

async fn tags(state: &AppState, ctx: &ProxyContext, path: &str, req: Request) -> Response {
    if !query_pairs(req.uri().query()).is_empty() {
        return transparent(ctx, path, req).await;
    }
    axum::Json(state.sync.tags(ctx.instance_id)).into_response()
}

enum Detail {
    Properties,
    Trackers,
    Files,
}

async fn torrent_detail(
    state: &AppState,
    ctx: &ProxyContext,
    path: &str,
    req: Request,
    detail: Detail,
) -> Response {
    let params = query_pairs(req.uri().query());
    let allow = match detail {
        Detail::Files => FILES_ALLOW,
        _ => HASH_ALLOW,
    };
    if !allow_listed(&params, allow) {
        return transparent(ctx, path, req).await;
    }
    let Some(hash) = params
        .iter()
        .find(|(k, _)| k == "hash")
        .map(|(_, v)| v.clone())
    else {
        return transparent(ctx, path, req).await;
    };

    let result = match detail {
        Detail::Properties => state
            .sync
            .torrent_properties(ctx.instance_id, &hash)
            .await
            .map(|p| axum::Json(p).into_response()),
        Detail::Trackers => state
            .sync
            .torrent_trackers(ctx.instance_id, &hash)
            .await
            .map(|t| axum::Json(t).into_response()),
        Detail::Files => {
            let indexes: Option<Vec<i64>> = params
                .iter()
                .find(|(k, _)| k == "indexes")
                .map(|(_, v)| v.split('|').filter_map(|i| i.trim().parse().ok()).collect());
            state
                .sync
                .torrent_files(ctx.instance_id, &hash, indexes.as_deref())
                .await
                .map(|f| axum::Json(f).into_response())
        }
    };

    result.unwrap_or_else(|err| {
        error!(
            instance_id = ctx.instance_id,
            error = %redact_err(&err),
            "aggregator detail fetch failed"
        );
        (
            StatusCode::BAD_GATEWAY,
            axum::Json(json!({"error": "Failed to connect to qBittorrent instance"})),
        )
            .into_response()
    })
}

/// Buffer, forward, then invalidate the file cache for each touched hash.
/// The invalidation is dispatched even if the forward path panics; the
/// panic is re-raised afterwards so the stack is preserved.
async fn write_intercept(
    state: &AppState,
    ctx: &ProxyContext,
    path: &str,
    req: Request,
) -> Response {
    let (parts, body) = req.into_parts();
    let bytes = match axum::body::to_bytes(body, MAX_BUFFERED_BODY).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                "request body exceeds maximum allowed size",
            )
                .into_response();
        }
    };

    let hashes = hashes_from_form(&bytes);

    let outcome = std::panic::AssertUnwindSafe(forward::forward_buffered(
        ctx,
        parts.method.clone(),
        path,
        parts.uri.query(),
        &parts.headers,
        bytes.clone(),
    ))
    .catch_unwind()
    .await;

    spawn_invalidation(state, ctx.instance_id, hashes);

    match outcome {
        Ok(Ok(resp)) => forward::into_response(resp),
        Ok(Err(resp)) => resp,
        Err(panic) => {
            error!(
                instance_id = ctx.instance_id,
                "panic in write intercept; cache invalidation dispatched"
            );
            std::panic::resume_unwind(panic);
        }
    }
}

fn spawn_invalidation(state: &AppState, instance_id: i64, hashes: Vec<String>) {
    if hashes.is_empty() {
        return;
    }
    let sync = state.sync.clone();
    // Independent background task: the invalidation must not be tied to the
    // (possibly already finished) downstream request.
    tokio::spawn(async move {
        let _ = tokio::time::timeout(INVALIDATION_BUDGET, async {
            for hash in &hashes {
                sync.invalidate_file_cache(instance_id, hash);
            }
        })
        .await;
    });
}

/// Reannounce: hand monitored hashes to the in-process service, forward
/// only the remainder; if nothing remains, short-circuit with "Ok.".
async fn reannounce(state: &AppState, ctx: &ProxyContext, path: &str, req: Request) -> Response {
    if !ctx.reannounce_enabled {
        return transparent(ctx, path, req).await;
    }

    let (parts, body) = req.into_parts();
    let bytes = match axum::body::to_bytes(body, MAX_BUFFERED_BODY).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                "request body exceeds maximum allowed size",
            )
                .into_response();
        }
    };

    let pairs: Vec<(String, String)> = form_urlencoded::parse(&bytes).into_owned().collect();
    let raw_hashes = pairs
        .iter()
        .find(|(k, _)| k == "hashes" || k == "hash")
        .map(|(_, v)| v.clone())
        .unwrap_or_default();
    let normalised = normalise_hashes(&raw_hashes);

    if normalised.is_empty() {
        return match forward::forward_buffered(
            ctx,
            parts.method,
            path,
            parts.uri.query(),
            &parts.headers,
            bytes,
        )
        .await
        {
            Ok(resp) => forward::into_response(resp),
            Err(resp) => resp,
        };
    }

    let claimed = state
        .reannounce
        .request_reannounce(ctx.instance_id, &normalised);
    let remaining: Vec<String> = normalised
        .iter()
        .filter(|h| !claimed.contains(h))
        .cloned()
        .collect();

    if remaining.is_empty() {
        let mut resp = (StatusCode::OK, "Ok.").into_response();
        resp.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        return resp;
    }

    let trimmed = {
        let mut serializer = form_urlencoded::Serializer::new(String::new());
        let mut hashes_written = false;
        for (k, v) in &pairs {
            if k == "hashes" || k == "hash" {
                if !hashes_written {
                    serializer.append_pair("hashes", &remaining.join("|"));
                    hashes_written = true;
                }
            } else {
                serializer.append_pair(k, v);
            }
        }
        bytes::Bytes::from(serializer.finish())
    };

    match forward::forward_buffered(
        ctx,
        parts.method,
        path,
        parts.uri.query(),
        &parts.headers,
        trimmed,
    )
    .await
    {
        Ok(resp) => forward::into_response(resp),
        Err(resp) => resp,
    }
}

fn query_pairs(query: Option<&str>) -> Vec<(String, String)> {
    query
        .map(|q| form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default()
}

fn allow_listed(params: &[(String, String)], allowed: &[&str]) -> bool {
    params.iter().all(|(k, _)| allowed.contains(&k.as_str()))
}

/// Forgiving parameter parsing: malformed numeric values are ignored and
/// defaults apply.
fn build_torrent_query(params: &[(String, String)]) -> TorrentQuery {
    let mut query = TorrentQuery::default();
    for (k, v) in params {
        match k.as_str() {
            "filter" => query.filter = Some(v.clone()),
            "category" => query.category = Some(v.clone()),
            "tag" => query.tag = Some(v.clone()),
            "sort" => query.sort = Some(v.clone()),
            "reverse" => query.reverse = matches!(v.as_str(), "true" | "1"),
            "limit" => {
                if let Ok(n) = v.parse() {
                    query.limit = Some(n);
                }
            }
            "offset" => {
                if let Ok(n) = v.parse() {
                    query.offset = n;
                }
            }
            "hashes" => {
                query.hashes = v
                    .split('|')
                    .map(str::trim)
                    .filter(|h| !h.is_empty())
                    .map(str::to_string)
                    .collect();
            }
            "search" => query.search = Some(v.clone()),
            _ => {}
        }
    }
    query
}

fn hashes_from_form(bytes: &[u8]) -> Vec<String> {
    for (k, v) in form_urlencoded::parse(bytes) {
        if k == "hash" {
            return vec![v.trim().to_string()];
        }
        if k == "hashes" {
            return v
                .split('|')
                .map(str::trim)
                .filter(|h| !h.is_empty())
                .map(str::to_string)
                .collect();
        }
    }
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn allow_list_rejects_unknown_params() {
        let params = vec![
            ("filter".to_string(), "all".to_string()),
            ("limit".to_string(), "10".to_string()),
        ];
        assert!(allow_listed(&params, INFO_ALLOW));

        let params = vec![("exclude_tag".to_string(), "x".to_string())];
        assert!(!allow_listed(&params, INFO_ALLOW));
        assert!(allow_listed(&[], INFO_ALLOW));
    }

    #[test]
    fn malformed_numeric_values_fall_back_to_defaults() {
        let params = vec![
            ("limit".to_string(), "banana".to_string()),
            ("offset".to_string(), "-3".to_string()),
            ("reverse".to_string(), "yes".to_string()),
        ];
        let query = build_torrent_query(&params);
        assert_eq!(query.limit, None);
        assert_eq!(query.offset, 0);
        assert!(!query.reverse);
    }

    #[test]
    fn form_hash_extraction() {
        assert_eq!(
            hashes_from_form(b"hashes=abcd%7Cef01&location=%2Fdata"),
            vec!["abcd".to_string(), "ef01".to_string()]
        );
        assert_eq!(
            hashes_from_form(b"hash=abcd&newPath=x"),
            vec!["abcd".to_string()]
        );
        assert!(hashes_from_form(b"location=%2Fdata").is_empty());
    }
}
