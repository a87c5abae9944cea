//! Persistent domain entities.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A configured upstream qBittorrent server.
#[derive(Debug, Clone, Serialize)]
pub struct Instance {
    pub id: i64,
    pub name: String,
    /// Absolute base URL; may carry a sub-path such as `/qbittorrent`.
    pub base_url: String,
    pub username: Option<String>,
    /// AES-256-GCM ciphertext + nonce, both base64. Never serialised.
    #[serde(skip)]
    pub password_cipher: Option<String>,
    #[serde(skip)]
    pub password_nonce: Option<String>,
    /// Send the credentials as `Authorization: Basic` on proxied requests.
    pub basic_auth: bool,
    pub tls_skip_verify: bool,
    pub timeout_secs: i64,
    pub is_active: bool,
    pub supports_torrent_creation: bool,
    /// Gateway has local filesystem access to this instance's data paths.
    pub has_filesystem_access: bool,
    pub reannounce_enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Instance {
    pub fn has_credentials(&self) -> bool {
        self.username.is_some() && self.password_cipher.is_some()
    }
}

/// An API key issued to a downstream tool, bound to exactly one instance.
/// The key value itself is never stored; only its SHA-256 hash is.
#[derive(Debug, Clone, Serialize)]
pub struct DownstreamKey {
    pub id: i64,
    pub client_name: String,
    #[serde(skip)]
    pub key_hash: String,
    pub instance_id: i64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}
