//! Per-instance authenticated HTTP clients.
//!
//! Every outbound request to an instance flows through that instance's
//! dedicated transport so per-instance TLS, timeouts, and cookie state are
//! honoured. The pool wires one shared retry transport whose selector
//! routes each request to the transport of the instance it targets.

mod instance;

pub use instance::{InstanceClient, InstanceTransport};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::redact::redact_err;
use crate::stores::{InstanceStore, StoreError};
use crate::transport::{RetryTransport, Transport};

/// How often instance health is re-checked in the background.
const HEALTH_REFRESH_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

struct PoolState {
    clients: RwLock<HashMap<i64, Arc<InstanceClient>>>,
    /// scheme://host:port → dedicated transport, for the retry selector.
    by_origin: RwLock<HashMap<String, Arc<InstanceTransport>>>,
}

/// Holds one [InstanceClient] per configured instance, built lazily and
/// shared across all requests for that instance.
pub struct ClientPool {
    state: Arc<PoolState>,
    retry: Arc<RetryTransport>,
    instances: Arc<InstanceStore>,
}

impl ClientPool {
    pub fn new(instances: Arc<InstanceStore>) -> Result<Arc<Self>> {
        let state = Arc::new(PoolState {
            clients: RwLock::new(HashMap::new()),
            by_origin: RwLock::new(HashMap::new()),
        });

        let default = reqwest::Client::builder()
            .timeout(DEFAULT_UPSTREAM_TIMEOUT)
            .build()
            .context("build default upstream client")?;

        let selector_state = Arc::downgrade(&state);
        let retry = Arc::new(RetryTransport::with_selector(
            Arc::new(default),
            Box::new(move |req| {
                let state = selector_state.upgrade()?;
                let origin = origin_key(req.url());
                state
                    .by_origin
                    .read()
                    .get(&origin)
                    .cloned()
                    .map(|t| t as Arc<dyn Transport>)
            }),
        ));

        Ok(Arc::new(Self {
            state,
            retry,
            instances,
        }))
    }

    /// Get (building if needed) the shared client for an instance.
    pub async fn get_client(&self, instance_id: i64) -> Result<Arc<InstanceClient>, StoreError> {
        if let Some(client) = self.state.clients.read().get(&instance_id) {
            return Ok(client.clone());
        }

        let instance = self.instances.get(instance_id).await?;
        let base_url: Url = instance
            .base_url
            .parse()
            .map_err(|e| StoreError::Other(anyhow::anyhow!("invalid instance base url: {e}")))?;

        let transport = InstanceTransport::new(
            Duration::from_secs(instance.timeout_secs.max(1) as u64),
            instance.tls_skip_verify,
        )?;
        let client = Arc::new(InstanceClient::new(
            instance_id,
            base_url.clone(),
            transport.clone(),
            self.retry.clone(),
        ));

        self.state
            .by_origin
            .write()
            .insert(origin_key(&base_url), transport);
        // A concurrent builder may have won the race; keep whichever landed.
        let mut clients = self.state.clients.write();
        let entry = clients.entry(instance_id).or_insert(client);
        Ok(entry.clone())
    }

    /// Health flag as of the last check; unknown instances read unhealthy.
    pub fn is_healthy(&self, instance_id: i64) -> bool {
        self.state
            .clients
            .read()
            .get(&instance_id)
            .is_some_and(|c| c.is_healthy())
    }

    /// Check an instance now: probe the version endpoint, re-login when the
    /// session cookie has expired. Updates the health flag.
    pub async fn check_instance(&self, instance_id: i64) -> Result<bool> {
        let instance = self.instances.get(instance_id).await?;
        let client = self.get_client(instance_id).await?;
        let credentials = match (&instance.username, self.instances.decrypted_password(&instance)?)
        {
            (Some(user), Some(pass)) => Some((user.clone(), pass)),
            _ => None,
        };
        Ok(client.check_health(credentials.as_ref()).await)
    }

    /// Drop the cached client (after an instance config change) so the next
    /// request rebuilds it with fresh settings.
    pub fn invalidate(&self, instance_id: i64) {
        let removed = self.state.clients.write().remove(&instance_id);
        if let Some(client) = removed {
            self.state
                .by_origin
                .write()
                .remove(&origin_key(client.base_url()));
        }
    }

    /// Background loop re-checking the health of every active instance.
    pub fn spawn_health_refresher(self: &Arc<Self>, token: CancellationToken) {
        let pool = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(HEALTH_REFRESH_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tick.tick() => {}
                }
                let Some(pool) = pool.upgrade() else { break };
                let instances = match pool.instances.list().await {
                    Ok(list) => list,
                    Err(err) => {
                        warn!(error = %err, "health refresh could not list instances");
                        continue;
                    }
                };
                for instance in instances.iter().filter(|i| i.is_active) {
                    match pool.check_instance(instance.id).await {
                        Ok(healthy) => {
                            debug!(instance_id = instance.id, healthy, "instance health checked");
                        }
                        Err(err) => {
                            warn!(
                                instance_id = instance.id,
                                error = %redact_err(&err),
                                "instance health check failed"
                            );
                        }
                    }
                }
            }
        });
    }
}

fn origin_key(url: &Url) -> String {
    let scheme = url.scheme();
    let host = url.host_str().unwrap_or_default();
    match url.port_or_known_default() {
        Some(port) => format!("{scheme}://{host}:{port}"),
        None => format!("{scheme}://{host}"),
    }
}

/// Join an instance base URL with an API suffix, preserving any base
/// sub-path. `https://h/qb` + `/api/v2/x` → path `/qb/api/v2/x`.
pub fn instance_url(base: &Url, suffix: &str) -> Url {
    let mut url = base.clone();
    url.set_path(&join_paths(base.path(), suffix));
    url.set_query(None);
    url.set_fragment(None);
    url
}

/// The rewrite rule: trim-trailing-slash(base) + "/" + trim-leading-slash
/// (suffix); degenerate empties yield "/". Never naive concatenation.
pub fn join_paths(base_path: &str, suffix: &str) -> String {
    let base = base_path.trim_end_matches('/');
    let suffix = suffix.trim_start_matches('/');
    if base.is_empty() && suffix.is_empty() {
        return "/".to_string();
    }
    format!("{base}/{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn join_preserves_base_sub_path() {
        assert_eq!(
            join_paths("/qb", "/api/v2/app/webapiVersion"),
            "/qb/api/v2/app/webapiVersion"
        );
        assert_eq!(
            join_paths("/", "/api/v2/app/webapiVersion"),
            "/api/v2/app/webapiVersion"
        );
        assert_eq!(join_paths("", ""), "/");
        assert_eq!(join_paths("/qbittorrent/", "app/version"), "/qbittorrent/app/version");
    }

    #[test]
    fn instance_url_rewrites_path_only() {
        let base: Url = "http://192.0.2.10:8080/qbittorrent".parse().unwrap();
        let url = instance_url(&base, "/api/v2/app/webapiVersion");
        assert_eq!(url.path(), "/qbittorrent/api/v2/app/webapiVersion");
        assert_eq!(url.host_str(), Some("192.0.2.10"));
        assert_eq!(url.port(), Some(8080));
    }

    #[test]
    fn origin_keys_include_default_ports() {
        let url: Url = "https://seedbox.example/qb".parse().unwrap();
        assert_eq!(origin_key(&url), "https://seedbox.example:443");
        let url: Url = "http://10.0.0.2:8080".parse().unwrap();
        assert_eq!(origin_key(&url), "http://10.0.0.2:8080");
    }
}
