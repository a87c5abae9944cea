//! Operator-facing configuration API.
//!
//! Instances and downstream keys are managed here; the proxy data plane
//! lives under `/proxy`.

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::error;

use crate::app::AppState;
use crate::models::{DownstreamKey, Instance};
use crate::redact::redact_err;
use crate::stores::{InstanceUpdate, NewInstance, StoreError};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/instances", get(list_instances).post(create_instance))
        .route("/instances/{id}", put(update_instance).delete(deactivate_instance))
        .route("/instances/{id}/test", post(test_instance))
        .route("/keys", get(list_keys).post(create_key))
        .route("/keys/{id}", delete(delete_key))
}

fn store_error_response(err: StoreError) -> Response {
    match err {
        StoreError::NotFound => {
            (StatusCode::NOT_FOUND, Json(json!({"error": "not found"}))).into_response()
        }
        err => {
            error!(error = %redact_err(&err.into()), "store operation failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "internal error"})),
            )
                .into_response()
        }
    }
}

async fn health(State(state): State<AppState>) -> Response {
    let database = match state.db.fetch_optional(sqlx::query("SELECT 1 AS one")).await {
        Ok(_) => "ok",
        Err(_) => "error",
    };
    let status = if database == "ok" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(json!({"status": "ok", "database": database}))).into_response()
}

#[derive(Debug, Deserialize)]
pub struct CreateInstanceRequest {
    pub name: String,
    pub base_url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default)]
    pub basic_auth: bool,
    #[serde(default)]
    pub tls_skip_verify: bool,
    pub timeout_secs: Option<i64>,
    #[serde(default)]
    pub supports_torrent_creation: bool,
    #[serde(default)]
    pub has_filesystem_access: bool,
    #[serde(default)]
    pub reannounce_enabled: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateInstanceRequest {
    pub name: Option<String>,
    pub base_url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub basic_auth: Option<bool>,
    pub tls_skip_verify: Option<bool>,
    pub timeout_secs: Option<i64>,
    pub is_active: Option<bool>,
    pub supports_torrent_creation: Option<bool>,
    pub has_filesystem_access: Option<bool>,
    pub reannounce_enabled: Option<bool>,
}

async fn list_instances(State(state): State<AppState>) -> Response {
    match state.instances.list().await {
        Ok(instances) => Json(instances).into_response(),
        Err(err) => store_error_response(err),
    }
}

async fn create_instance(
    State(state): State<AppState>,
    Json(body): Json<CreateInstanceRequest>,
) -> Response {
    if body.name.trim().is_empty() || url::Url::parse(&body.base_url).is_err() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "name and a valid base_url are required"})),
        )
            .into_response();
    }
    let new = NewInstance {
        name: body.name,
        base_url: body.base_url,
        username: body.username,
        password: body.password,
        basic_auth: body.basic_auth,
        tls_skip_verify: body.tls_skip_verify,
        timeout_secs: body.timeout_secs,
        supports_torrent_creation: body.supports_torrent_creation,
        has_filesystem_access: body.has_filesystem_access,
        reannounce_enabled: body.reannounce_enabled,
    };
    match state.instances.create(new).await {
        Ok(instance) => {
            state
                .reannounce
                .set_enabled(instance.id, instance.reannounce_enabled);
            (StatusCode::CREATED, Json(instance)).into_response()
        }
        Err(err) => store_error_response(err),
    }
}

async fn update_instance(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<UpdateInstanceRequest>,
) -> Response {
    let update = InstanceUpdate {
        name: body.name,
        base_url: body.base_url,
        username: body.username.map(Some),
        password: body.password.map(Some),
        basic_auth: body.basic_auth,
        tls_skip_verify: body.tls_skip_verify,
        timeout_secs: body.timeout_secs,
        is_active: body.is_active,
        supports_torrent_creation: body.supports_torrent_creation,
        has_filesystem_access: body.has_filesystem_access,
        reannounce_enabled: body.reannounce_enabled,
    };
    match state.instances.update(id, update).await {
        Ok(instance) => {
            // Connection settings may have changed; rebuild lazily.
            state.pool.invalidate(id);
            state
                .reannounce
                .set_enabled(instance.id, instance.reannounce_enabled);
            Json(instance).into_response()
        }
        Err(err) => store_error_response(err),
    }
}

async fn deactivate_instance(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match state.instances.deactivate(id).await {
        Ok(()) => {
            state.pool.invalidate(id);
            state.reannounce.set_enabled(id, false);
            StatusCode::NO_CONTENT.into_response()
        }
        Err(err) => store_error_response(err),
    }
}

async fn test_instance(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match state.pool.check_instance(id).await {
        Ok(healthy) => Json(json!({"healthy": healthy})).into_response(),
        Err(err) => {
            error!(instance_id = id, error = %redact_err(&err), "instance test failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({"healthy": false, "error": "connection failed"})),
            )
                .into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateKeyRequest {
    pub client_name: String,
    pub instance_id: i64,
}

/// Create-key response; `key` is shown exactly once.
#[derive(Debug, Serialize)]
pub struct CreatedKeyResponse {
    #[serde(flatten)]
    pub info: DownstreamKey,
    pub key: String,
}

async fn list_keys(State(state): State<AppState>) -> Response {
    match state.keys.list().await {
        Ok(keys) => Json(keys).into_response(),
        Err(err) => store_error_response(err),
    }
}

async fn create_key(
    State(state): State<AppState>,
    Json(body): Json<CreateKeyRequest>,
) -> Response {
    // The key must bind to a configured instance.
    let instance: Result<Instance, _> = state.instances.get(body.instance_id).await;
    if let Err(err) = instance {
        return store_error_response(err);
    }
    match state.keys.create(&body.client_name, body.instance_id).await {
        Ok(created) => (
            StatusCode::CREATED,
            Json(CreatedKeyResponse {
                info: created.key,
                key: created.plaintext,
            }),
        )
            .into_response(),
        Err(err) => store_error_response(err),
    }
}

async fn delete_key(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match state.keys.delete(id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => store_error_response(err),
    }
}
