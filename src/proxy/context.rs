//! Per-request proxy context.
//!
//! Built once on entry to a proxied route and passed explicitly to every
//! intercept handler; decrypted credentials live only as long as this
//! struct does.

use std::sync::Arc;

use axum::http::HeaderMap;
use url::Url;

use crate::app::AppState;
use crate::clients::InstanceClient;
use crate::models::DownstreamKey;
use crate::stores::StoreError;

/// Why context construction failed; the entry handler maps these to
/// responses (all upstream-facing failures read as 502).
pub enum ContextError {
    InstanceNotFound,
    InstanceInactive,
    InvalidBaseUrl,
    Internal(anyhow::Error),
}

pub struct ProxyContext {
    pub instance_id: i64,
    pub instance_url: Url,
    pub client: Arc<InstanceClient>,
    /// Decrypted basic-auth credentials, present only when the instance has
    /// `basic_auth` switched on.
    pub basic_auth: Option<(String, String)>,
    pub client_name: String,
    pub downstream_https: bool,
    pub reannounce_enabled: bool,
}

impl ProxyContext {
    /// Assemble the context: resolve the instance, reject inactive ones,
    /// parse its URL, borrow the shared client, and decrypt credentials.
    pub async fn build(
        state: &AppState,
        key: &DownstreamKey,
        headers: &HeaderMap,
    ) -> Result<Self, ContextError> {
        let instance = match state.instances.get(key.instance_id).await {
            Ok(instance) => instance,
            Err(StoreError::NotFound) => return Err(ContextError::InstanceNotFound),
            Err(err) => return Err(ContextError::Internal(err.into())),
        };
        if !instance.is_active {
            return Err(ContextError::InstanceInactive);
        }

        let instance_url: Url = instance
            .base_url
            .parse()
            .map_err(|_| ContextError::InvalidBaseUrl)?;

        let client = state
            .pool
            .get_client(instance.id)
            .await
            .map_err(|e| ContextError::Internal(e.into()))?;

        let basic_auth = if instance.basic_auth {
            match (
                instance.username.clone(),
                state
                    .instances
                    .decrypted_password(&instance)
                    .map_err(|e| ContextError::Internal(e.into()))?,
            ) {
                (Some(user), Some(pass)) => Some((user, pass)),
                _ => None,
            }
        } else {
            None
        };

        Ok(Self {
            instance_id: instance.id,
            instance_url,
            client,
            basic_auth,
            client_name: key.client_name.clone(),
            downstream_https: downstream_was_https(headers),
            reannounce_enabled: instance.reannounce_enabled,
        })
    }
}

/// Trusted-header detection of whether the downstream leg was HTTPS:
/// `X-Forwarded-Proto`, then `Forwarded: …proto=https`. Behind no proxy the
/// gateway itself serves plain HTTP, so the fallback is false.
pub fn downstream_was_https(headers: &HeaderMap) -> bool {
    if let Some(proto) = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
    {
        return proto.trim().eq_ignore_ascii_case("https");
    }
    if let Some(forwarded) = headers.get("forwarded").and_then(|v| v.to_str().ok()) {
        return forwarded
            .to_ascii_lowercase()
            .split(';')
            .flat_map(|part| part.split(','))
            .any(|pair| pair.trim() == "proto=https");
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn https_detection_prefers_x_forwarded_proto() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-proto", HeaderValue::from_static("https"));
        assert!(downstream_was_https(&headers));

        headers.insert("x-forwarded-proto", HeaderValue::from_static("http"));
        assert!(!downstream_was_https(&headers));
    }

    #[test]
    fn https_detection_reads_forwarded_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "forwarded",
            HeaderValue::from_static("for=192.0.2.60;proto=https;by=203.0.113.43"),
        );
        assert!(downstream_was_https(&headers));

        let mut headers = HeaderMap::new();
        headers.insert("forwarded", HeaderValue::from_static("proto=http"));
        assert!(!downstream_was_https(&headers));
    }

    #[test]
    fn defaults_to_plain_http() {
        assert!(!downstream_was_https(&HeaderMap::new()));
    }
}
