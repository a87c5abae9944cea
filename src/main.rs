//! Gateway entry point.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use qui_gateway::app::{AppState, build_app};
use qui_gateway::clients::ClientPool;
use qui_gateway::config::Config;
use qui_gateway::crypto::CredentialEncryption;
use qui_gateway::db::Db;
use qui_gateway::metrics::Metrics;
use qui_gateway::reannounce::ReannounceService;
use qui_gateway::stores::{InstanceStore, KeyStore};
use qui_gateway::sync::SyncManager;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let config = Arc::new(Config::from_env()?);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_filter.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let metrics = Metrics::new()?;
    let db = Db::open(&config.database_path, metrics.clone())
        .await
        .context("open database")?;

    let encryption = CredentialEncryption::from_base64_key(&config.session_secret)
        .context("invalid QUI__SESSION_SECRET")?;
    let instances = InstanceStore::new(db.clone(), encryption);
    let keys = KeyStore::new(db.clone());

    let pool = ClientPool::new(instances.clone()).context("build client pool")?;
    let shutdown = CancellationToken::new();
    pool.spawn_health_refresher(shutdown.clone());

    let sync = SyncManager::new(db.clone(), pool.clone());
    let reannounce = ReannounceService::new();
    for instance in instances.list().await.context("list instances")? {
        reannounce.set_enabled(instance.id, instance.reannounce_enabled);
    }

    let state = AppState {
        config: config.clone(),
        db: db.clone(),
        keys: keys.clone(),
        instances,
        pool,
        sync,
        reannounce,
        metrics,
    };

    let app = build_app(state);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(
        addr = %addr,
        base_path = %if config.base_path.is_empty() { "/" } else { &config.base_path },
        "gateway listening"
    );

    let shutdown_signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            shutdown_signal.cancel();
        })
        .await
        .context("serve")?;

    keys.shutdown();
    db.close().await;
    Ok(())
}
