//! A single instance's HTTP client: dedicated transport, cookie jar, and
//! the qBittorrent login ceremony that materialises the session cookie.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use futures::future::BoxFuture;
use parking_lot::RwLock;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::{CONTENT_TYPE, COOKIE, HeaderValue, SET_COOKIE};
use reqwest::{Method, Request, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use url::Url;
use url::form_urlencoded;

use crate::redact::redact_url;
use crate::transport::{RetryTransport, Transport, TransportError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Dedicated transport for one instance. `close_idle_connections` swaps in
/// a fresh client; dropping the old one closes its pooled sockets.
pub struct InstanceTransport {
    client: RwLock<reqwest::Client>,
    timeout: Duration,
    tls_skip_verify: bool,
}

impl InstanceTransport {
    pub fn new(timeout: Duration, tls_skip_verify: bool) -> Result<Arc<Self>> {
        let client = build_client(timeout, tls_skip_verify)?;
        Ok(Arc::new(Self {
            client: RwLock::new(client),
            timeout,
            tls_skip_verify,
        }))
    }
}

impl Transport for InstanceTransport {
    fn execute(&self, req: Request) -> BoxFuture<'static, Result<Response, TransportError>> {
        let client = self.client.read().clone();
        Box::pin(async move { client.execute(req).await.map_err(TransportError::from) })
    }

    fn close_idle_connections(&self) {
        match build_client(self.timeout, self.tls_skip_verify) {
            Ok(fresh) => {
                *self.client.write() = fresh;
            }
            Err(err) => {
                warn!(error = %err, "could not rebuild instance client; keeping old pool");
            }
        }
    }
}

fn build_client(timeout: Duration, tls_skip_verify: bool) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(CONNECT_TIMEOUT);
    if tls_skip_verify {
        builder = builder.danger_accept_invalid_certs(true);
    }
    builder.build().context("build instance HTTP client")
}

/// Runtime client for one instance. Shared across every request targeting
/// that instance; the jar is internally thread-safe.
pub struct InstanceClient {
    instance_id: i64,
    base_url: Url,
    jar: Arc<Jar>,
    transport: Arc<InstanceTransport>,
    retry: Arc<RetryTransport>,
    healthy: AtomicBool,
}

impl InstanceClient {
    pub fn new(
        instance_id: i64,
        base_url: Url,
        transport: Arc<InstanceTransport>,
        retry: Arc<RetryTransport>,
    ) -> Self {
        Self {
            instance_id,
            base_url,
            jar: Arc::new(Jar::default()),
            transport,
            retry,
            healthy: AtomicBool::new(false),
        }
    }

    pub fn instance_id(&self) -> i64 {
        self.instance_id
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn transport(&self) -> &Arc<InstanceTransport> {
        &self.transport
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    /// All cookies for the instance base URL as one `name=value; …` header.
    pub fn cookie_header(&self) -> Option<HeaderValue> {
        self.jar.cookies(&self.base_url)
    }

    /// Execute through the shared retry transport (whose selector routes to
    /// this instance's dedicated transport).
    pub async fn execute(&self, req: Request) -> Result<Response, TransportError> {
        self.retry.execute(req).await
    }

    /// Log in to the instance, capturing the SID cookie into the jar.
    pub async fn login(&self, username: &str, password: &str) -> Result<()> {
        let url = super::instance_url(&self.base_url, "/api/v2/auth/login");
        let body = form_urlencoded::Serializer::new(String::new())
            .append_pair("username", username)
            .append_pair("password", password)
            .finish();

        let mut req = Request::new(Method::POST, url.clone());
        req.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded"),
        );
        *req.body_mut() = Some(body.into());

        let resp = self.retry.execute(req).await?;
        let status = resp.status();
        let mut set_cookies = resp.headers().get_all(SET_COOKIE).iter();
        self.jar.set_cookies(&mut set_cookies, &url);

        let text = resp.text().await.unwrap_or_default();
        if status.is_success() && text.trim().starts_with("Ok") {
            debug!(instance_id = self.instance_id, "logged in to instance");
            Ok(())
        } else {
            Err(anyhow!(
                "login to {} rejected (status {})",
                redact_url(&self.base_url),
                status
            ))
        }
    }

    /// Probe the instance. On an expired session, log in once and re-probe.
    /// Updates and returns the health flag.
    pub async fn check_health(&self, credentials: Option<&(String, String)>) -> bool {
        let healthy = match self.probe().await {
            Ok(status) if status.is_success() => true,
            Ok(status)
                if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) =>
            {
                match credentials {
                    Some((user, pass)) => match self.login(user, pass).await {
                        Ok(()) => self
                            .probe()
                            .await
                            .map(|s| s.is_success())
                            .unwrap_or(false),
                        Err(err) => {
                            warn!(
                                instance_id = self.instance_id,
                                error = %err,
                                "instance login failed"
                            );
                            false
                        }
                    },
                    None => false,
                }
            }
            Ok(_) => false,
            Err(_) => false,
        };
        self.healthy.store(healthy, Ordering::Relaxed);
        healthy
    }

    async fn probe(&self) -> Result<StatusCode, TransportError> {
        let url = super::instance_url(&self.base_url, "/api/v2/app/version");
        let mut req = Request::new(Method::GET, url);
        if let Some(cookies) = self.cookie_header() {
            req.headers_mut().insert(COOKIE, cookies);
        }
        Ok(self.retry.execute(req).await?.status())
    }

    /// GET a JSON endpoint on the instance with the session cookie attached.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T> {
        let mut url = super::instance_url(&self.base_url, path);
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in query {
                pairs.append_pair(k, v);
            }
        }

        let mut req = Request::new(Method::GET, url.clone());
        if let Some(cookies) = self.cookie_header() {
            req.headers_mut().insert(COOKIE, cookies);
        }

        let resp = self.retry.execute(req).await?;
        if !resp.status().is_success() {
            return Err(anyhow!(
                "upstream {} returned {}",
                redact_url(&url),
                resp.status()
            ));
        }
        resp.json::<T>().await.context("decode upstream JSON")
    }
}
