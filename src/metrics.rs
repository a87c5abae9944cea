//! Prometheus metrics exposed by the gateway core.

use std::sync::Arc;

use anyhow::{Context, Result};
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

/// Registry plus the counters the core increments. One per process.
pub struct Metrics {
    registry: Registry,
    /// Wedged-transaction detections ("cannot start a transaction within a
    /// transaction" on the writer connection).
    pub db_wedged_transactions: IntCounter,
    /// Cumulative string-pool rows deleted by the cleanup sweep.
    pub string_pool_deleted: IntCounter,
    /// Proxy requests by outcome (ok, unauthorized, upstream_error).
    pub proxy_requests: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>> {
        let registry = Registry::new();

        let db_wedged_transactions = IntCounter::with_opts(Opts::new(
            "qui_db_wedged_transaction_total",
            "Writer connection found mid-transaction at Begin",
        ))?;
        let string_pool_deleted = IntCounter::with_opts(Opts::new(
            "qui_string_pool_deleted_total",
            "Interned strings removed by the periodic cleanup",
        ))?;
        let proxy_requests = IntCounterVec::new(
            Opts::new("qui_proxy_requests_total", "Proxied downstream requests"),
            &["outcome"],
        )?;

        registry
            .register(Box::new(db_wedged_transactions.clone()))
            .context("register wedged counter")?;
        registry
            .register(Box::new(string_pool_deleted.clone()))
            .context("register string pool counter")?;
        registry
            .register(Box::new(proxy_requests.clone()))
            .context("register proxy counter")?;

        Ok(Arc::new(Self {
            registry,
            db_wedged_transactions,
            string_pool_deleted,
            proxy_requests,
        }))
    }

    /// Render the registry in Prometheus text exposition format.
    pub fn render(&self) -> Result<String> {
        let mut buf = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buf)
            .context("encode metrics")?;
        String::from_utf8(buf).context("metrics output was not UTF-8")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_render_with_expected_names() {
        let metrics = Metrics::new().unwrap();
        metrics.db_wedged_transactions.inc();
        metrics.string_pool_deleted.inc_by(3);
        metrics.proxy_requests.with_label_values(&["ok"]).inc();

        let out = metrics.render().unwrap();
        assert!(out.contains("qui_db_wedged_transaction_total 1"));
        assert!(out.contains("qui_string_pool_deleted_total 3"));
        assert!(out.contains("qui_proxy_requests_total{outcome=\"ok\"} 1"));
    }
}
