//! Application configuration loaded from environment variables.

use std::env;

use anyhow::{Context, Result};
use tracing::warn;

use crate::crypto::CredentialEncryption;

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Bind host.
    pub host: String,

    /// Bind port.
    pub port: u16,

    /// Path prefix the gateway is served under ("" when at the root).
    pub base_path: String,

    /// SQLite database file path.
    pub database_path: String,

    /// Base64 AES-256 key used to encrypt instance credentials at rest.
    pub session_secret: String,

    /// Default tracing filter when RUST_LOG is unset.
    pub log_filter: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let port = env::var("PORT")
            .unwrap_or_else(|_| "7476".to_string())
            .parse()
            .context("invalid PORT")?;

        // A missing secret would make stored credentials unrecoverable
        // across restarts; generate one for dev but say so loudly.
        let session_secret = env::var("QUI__SESSION_SECRET").unwrap_or_else(|_| {
            let key = CredentialEncryption::generate_key();
            warn!("QUI__SESSION_SECRET not set; generated an ephemeral key (dev only)");
            key
        });

        Ok(Self {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port,
            base_path: normalize_base_path(
                &env::var("QUI__BASE_URL").unwrap_or_else(|_| "/".to_string()),
            ),
            database_path: env::var("DATABASE_PATH")
                .unwrap_or_else(|_| "./data/qui-gateway.db".to_string()),
            session_secret,
            log_filter: env::var("QUI__LOG_LEVEL")
                .unwrap_or_else(|_| "qui_gateway=info,tower_http=info".to_string()),
        })
    }
}

/// Normalize a configured base path: missing configuration defaults to the
/// root, i.e. an empty prefix.
pub fn normalize_base_path(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() || trimmed == "/" {
        return String::new();
    }
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn base_path_normalization() {
        assert_eq!(normalize_base_path("/"), "");
        assert_eq!(normalize_base_path(""), "");
        assert_eq!(normalize_base_path("/qui"), "/qui");
        assert_eq!(normalize_base_path("qui/"), "/qui");
        assert_eq!(normalize_base_path("/qui/"), "/qui");
    }
}
