//! Transient-error retry transport.
//!
//! Wraps a base transport so a narrow set of transient network errors is
//! retried with bounded exponential backoff, on safe methods only. Status
//! codes are never inspected; upstream 5xx responses pass through.

use std::sync::Arc;
use std::time::Duration;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use futures::future::BoxFuture;
use reqwest::{Method, Request, Response};
use thiserror::Error;
use tracing::{info, warn};

use crate::redact::redact_str;

/// Maximum retries after the initial attempt (4 round-trips total).
pub const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_millis(50);
const MAX_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// A pluggable HTTP round-tripper. `close_idle_connections` lets a wrapper
/// flush stale pooled sockets after a failure; the default is a no-op.
pub trait Transport: Send + Sync {
    fn execute(&self, req: Request) -> BoxFuture<'static, Result<Response, TransportError>>;

    fn close_idle_connections(&self) {}
}

impl Transport for reqwest::Client {
    fn execute(&self, req: Request) -> BoxFuture<'static, Result<Response, TransportError>> {
        let client = self.clone();
        Box::pin(async move { client.execute(req).await.map_err(TransportError::from) })
    }
}

/// Picks a base transport per request; `None` falls back to the default.
pub type TransportSelector = dyn Fn(&Request) -> Option<Arc<dyn Transport>> + Send + Sync;

/// Retrying wrapper around a [Transport].
pub struct RetryTransport {
    default: Arc<dyn Transport>,
    selector: Option<Box<TransportSelector>>,
    max_retries: u32,
}

impl RetryTransport {
    pub fn new(default: Arc<dyn Transport>) -> Self {
        Self {
            default,
            selector: None,
            max_retries: MAX_RETRIES,
        }
    }

    /// Route each request through the transport the selector returns (e.g.
    /// the dedicated transport of the instance the request targets).
    pub fn with_selector(
        default: Arc<dyn Transport>,
        selector: Box<TransportSelector>,
    ) -> Self {
        Self {
            default,
            selector: Some(selector),
            max_retries: MAX_RETRIES,
        }
    }

    pub async fn execute(&self, req: Request) -> Result<Response, TransportError> {
        let base = self
            .selector
            .as_ref()
            .and_then(|s| s(&req))
            .unwrap_or_else(|| self.default.clone());

        let mut backoff = ExponentialBackoff {
            initial_interval: INITIAL_BACKOFF,
            randomization_factor: 0.0,
            multiplier: 2.0,
            max_interval: MAX_BACKOFF,
            max_elapsed_time: None,
            ..Default::default()
        };

        let mut attempt: u32 = 0;
        loop {
            let this_attempt = match req.try_clone() {
                Some(clone) => clone,
                // A streaming body cannot be replayed; single shot.
                None => return base.execute(req).await,
            };

            match base.execute(this_attempt).await {
                Ok(resp) => {
                    if attempt > 0 {
                        info!(attempts = attempt + 1, "request succeeded after retry");
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if !is_retryable(&err)
                        || !is_idempotent(req.method())
                        || attempt >= self.max_retries
                    {
                        return Err(err);
                    }

                    base.close_idle_connections();

                    let delay = backoff.next_backoff().unwrap_or(MAX_BACKOFF);
                    warn!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %redact_str(&err.to_string()),
                        "transient upstream error; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Proxied qBittorrent mutations travel as POST, so PUT/DELETE are
/// conservatively excluded too.
fn is_idempotent(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE
    )
}

/// The classifier table. The dial/read distinction is load-bearing: a dial
/// timeout means the server never saw the request, a read timeout means it
/// may be processing it.
pub(crate) fn is_retryable(err: &TransportError) -> bool {
    match err {
        TransportError::Io(io) => is_retryable_io(io),
        TransportError::Http(err) => {
            if err.is_connect() {
                return true;
            }
            if err.is_timeout() {
                return false;
            }
            let mut source = std::error::Error::source(err);
            while let Some(cause) = source {
                if let Some(io) = cause.downcast_ref::<std::io::Error>() {
                    return is_retryable_io(io);
                }
                source = cause.source();
            }
            is_retryable_message(&err.to_string())
        }
    }
}

fn is_retryable_io(err: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset | ErrorKind::BrokenPipe => true,
        ErrorKind::UnexpectedEof | ErrorKind::TimedOut => false,
        _ => is_retryable_message(&err.to_string()),
    }
}

fn is_retryable_message(msg: &str) -> bool {
    let msg = msg.to_ascii_lowercase();
    if msg.contains("connection refused")
        || msg.contains("connection reset")
        || msg.contains("broken pipe")
        || msg.contains("no such host")
        || msg.contains("network is unreachable")
    {
        return true;
    }
    if msg.contains("unexpected eof") {
        return false;
    }
    msg.contains("eof")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io;
    use std::sync::atomic::{AtomicU32, Ordering};

    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    enum Scripted {
        Status(u16),
        Err(io::ErrorKind),
    }

    struct MockTransport {
        script: Mutex<VecDeque<Scripted>>,
        calls: AtomicU32,
        idle_closes: AtomicU32,
    }

    impl MockTransport {
        fn new(script: Vec<Scripted>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: AtomicU32::new(0),
                idle_closes: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Transport for MockTransport {
        fn execute(&self, _req: Request) -> BoxFuture<'static, Result<Response, TransportError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let step = self.script.lock().pop_front();
            Box::pin(async move {
                match step {
                    Some(Scripted::Status(code)) => {
                        let resp = axum::http::Response::builder()
                            .status(code)
                            .body("ok".to_string())
                            .unwrap();
                        Ok(Response::from(resp))
                    }
                    Some(Scripted::Err(kind)) => {
                        Err(TransportError::Io(io::Error::new(kind, "scripted failure")))
                    }
                    None => panic!("mock transport exhausted"),
                }
            })
        }

        fn close_idle_connections(&self) {
            self.idle_closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn request(method: Method) -> Request {
        Request::new(method, "http://x/".parse().unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn retries_connection_refused_on_get() {
        let mock = MockTransport::new(vec![
            Scripted::Err(io::ErrorKind::ConnectionRefused),
            Scripted::Err(io::ErrorKind::ConnectionRefused),
            Scripted::Status(200),
        ]);
        let retry = RetryTransport::new(mock.clone());

        let started = tokio::time::Instant::now();
        let resp = retry.execute(request(Method::GET)).await.unwrap();

        assert_eq!(resp.status(), 200);
        assert_eq!(mock.calls(), 3);
        // Backoff between attempts: 50 ms then 100 ms.
        assert!(started.elapsed() >= Duration::from_millis(150));
        assert_eq!(mock.idle_closes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn does_not_retry_post() {
        let mock = MockTransport::new(vec![Scripted::Err(io::ErrorKind::ConnectionRefused)]);
        let retry = RetryTransport::new(mock.clone());

        let err = retry.execute(request(Method::POST)).await.unwrap_err();
        assert!(is_retryable(&err));
        assert_eq!(mock.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_retries() {
        let script = (0..=MAX_RETRIES)
            .map(|_| Scripted::Err(io::ErrorKind::ConnectionReset))
            .collect();
        let mock = MockTransport::new(script);
        let retry = RetryTransport::new(mock.clone());

        retry.execute(request(Method::GET)).await.unwrap_err();
        assert_eq!(mock.calls(), MAX_RETRIES + 1);
    }

    #[tokio::test]
    async fn read_timeout_is_not_retried() {
        let mock = MockTransport::new(vec![Scripted::Err(io::ErrorKind::TimedOut)]);
        let retry = RetryTransport::new(mock.clone());

        retry.execute(request(Method::GET)).await.unwrap_err();
        assert_eq!(mock.calls(), 1);
    }

    #[tokio::test]
    async fn selector_routes_to_instance_transport() {
        let fallback = MockTransport::new(vec![]);
        let dedicated = MockTransport::new(vec![Scripted::Status(200)]);

        let selected = dedicated.clone();
        let retry = RetryTransport::with_selector(
            fallback.clone(),
            Box::new(move |req| {
                (req.url().host_str() == Some("x")).then(|| selected.clone() as Arc<dyn Transport>)
            }),
        );

        retry.execute(request(Method::GET)).await.unwrap();
        assert_eq!(fallback.calls(), 0);
        assert_eq!(dedicated.calls(), 1);
    }

    #[test]
    fn classifier_table() {
        let io_err = |kind| TransportError::Io(io::Error::new(kind, "x"));
        assert!(is_retryable(&io_err(io::ErrorKind::ConnectionRefused)));
        assert!(is_retryable(&io_err(io::ErrorKind::ConnectionReset)));
        assert!(is_retryable(&io_err(io::ErrorKind::BrokenPipe)));
        assert!(!is_retryable(&io_err(io::ErrorKind::UnexpectedEof)));
        assert!(!is_retryable(&io_err(io::ErrorKind::TimedOut)));

        let msg = |m: &str| TransportError::Io(io::Error::other(m));
        assert!(is_retryable(&msg("tcp connect: connection refused")));
        assert!(is_retryable(&msg("no such host")));
        assert!(is_retryable(&msg("network is unreachable")));
        assert!(is_retryable(&msg("eof while reading")));
        assert!(!is_retryable(&msg("unexpected eof during handshake")));
        assert!(!is_retryable(&msg("tls certificate invalid")));
    }
}
