//! Multi-instance management gateway for qBittorrent.
//!
//! One operator, many qBittorrent servers: the gateway aggregates instance
//! state for dashboards and search, presents each instance as a native
//! qBittorrent endpoint to downstream tools via per-key reverse proxying,
//! and runs periodic background work against the instances.

pub mod api;
pub mod app;
pub mod clients;
pub mod config;
pub mod crypto;
pub mod db;
pub mod metrics;
pub mod models;
pub mod proxy;
pub mod reannounce;
pub mod redact;
pub mod stores;
pub mod sync;
pub mod transport;

pub use app::{AppState, build_app};
pub use config::Config;
