//! Instance repository.
//!
//! Owns decryption of instance passwords: plaintext only leaves this store
//! on its way into a short-lived proxy context.

use std::sync::Arc;

use anyhow::Context;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use crate::crypto::CredentialEncryption;
use crate::db::helpers::{bool_to_int, int_to_bool, now_iso8601, str_to_datetime};
use crate::db::Db;
use crate::models::Instance;

use super::StoreError;

const INSTANCE_COLUMNS: &str = "id, name, base_url, username, password_cipher, password_nonce, \
     basic_auth, tls_skip_verify, timeout_secs, is_active, supports_torrent_creation, \
     has_filesystem_access, reannounce_enabled, created_at, updated_at";

/// Fields accepted when creating an instance.
pub struct NewInstance {
    pub name: String,
    pub base_url: String,
    pub username: Option<String>,
    /// Plaintext; encrypted before it touches the database.
    pub password: Option<String>,
    pub basic_auth: bool,
    pub tls_skip_verify: bool,
    pub timeout_secs: Option<i64>,
    pub supports_torrent_creation: bool,
    pub has_filesystem_access: bool,
    pub reannounce_enabled: bool,
}

/// Partial update; `None` leaves a field untouched.
#[derive(Default)]
pub struct InstanceUpdate {
    pub name: Option<String>,
    pub base_url: Option<String>,
    pub username: Option<Option<String>>,
    pub password: Option<Option<String>>,
    pub basic_auth: Option<bool>,
    pub tls_skip_verify: Option<bool>,
    pub timeout_secs: Option<i64>,
    pub is_active: Option<bool>,
    pub supports_torrent_creation: Option<bool>,
    pub has_filesystem_access: Option<bool>,
    pub reannounce_enabled: Option<bool>,
}

pub struct InstanceStore {
    db: Arc<Db>,
    encryption: CredentialEncryption,
}

impl InstanceStore {
    pub fn new(db: Arc<Db>, encryption: CredentialEncryption) -> Arc<Self> {
        Arc::new(Self { db, encryption })
    }

    pub async fn get(&self, id: i64) -> Result<Instance, StoreError> {
        let sql = format!("SELECT {INSTANCE_COLUMNS} FROM instances WHERE id = ?");
        let row = self
            .db
            .fetch_optional(sqlx::query(&sql).bind(id))
            .await?
            .ok_or(StoreError::NotFound)?;
        row_to_instance(&row).map_err(Into::into)
    }

    pub async fn list(&self) -> Result<Vec<Instance>, StoreError> {
        let sql = format!("SELECT {INSTANCE_COLUMNS} FROM instances ORDER BY name");
        let rows = self.db.fetch_all(sqlx::query(&sql)).await?;
        rows.iter()
            .map(|r| row_to_instance(r).map_err(Into::into))
            .collect()
    }

    pub async fn create(&self, new: NewInstance) -> Result<Instance, StoreError> {
        let (cipher, nonce) = match new.password.as_deref() {
            Some(plain) => {
                let (c, n) = self
                    .encryption
                    .encrypt(plain)
                    .context("encrypt instance password")?;
                (Some(c), Some(n))
            }
            None => (None, None),
        };

        let now = now_iso8601();
        let sql = format!(
            "INSERT INTO instances (name, base_url, username, password_cipher, password_nonce, \
             basic_auth, tls_skip_verify, timeout_secs, is_active, supports_torrent_creation, \
             has_filesystem_access, reannounce_enabled, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?, ?, ?, ?) \
             RETURNING {INSTANCE_COLUMNS}"
        );
        let row = self
            .db
            .fetch_optional(
                sqlx::query(&sql)
                    .bind(&new.name)
                    .bind(&new.base_url)
                    .bind(&new.username)
                    .bind(&cipher)
                    .bind(&nonce)
                    .bind(bool_to_int(new.basic_auth))
                    .bind(bool_to_int(new.tls_skip_verify))
                    .bind(new.timeout_secs.unwrap_or(30))
                    .bind(bool_to_int(new.supports_torrent_creation))
                    .bind(bool_to_int(new.has_filesystem_access))
                    .bind(bool_to_int(new.reannounce_enabled))
                    .bind(&now)
                    .bind(&now),
            )
            .await?
            .ok_or(StoreError::NotFound)?;
        row_to_instance(&row).map_err(Into::into)
    }

    pub async fn update(&self, id: i64, update: InstanceUpdate) -> Result<Instance, StoreError> {
        let mut current = self.get(id).await?;

        if let Some(name) = update.name {
            current.name = name;
        }
        if let Some(base_url) = update.base_url {
            current.base_url = base_url;
        }
        if let Some(username) = update.username {
            current.username = username;
        }
        if let Some(password) = update.password {
            match password.as_deref() {
                Some(plain) => {
                    let (c, n) = self
                        .encryption
                        .encrypt(plain)
                        .context("encrypt instance password")?;
                    current.password_cipher = Some(c);
                    current.password_nonce = Some(n);
                }
                None => {
                    current.password_cipher = None;
                    current.password_nonce = None;
                }
            }
        }
        if let Some(v) = update.basic_auth {
            current.basic_auth = v;
        }
        if let Some(v) = update.tls_skip_verify {
            current.tls_skip_verify = v;
        }
        if let Some(v) = update.timeout_secs {
            current.timeout_secs = v;
        }
        if let Some(v) = update.is_active {
            current.is_active = v;
        }
        if let Some(v) = update.supports_torrent_creation {
            current.supports_torrent_creation = v;
        }
        if let Some(v) = update.has_filesystem_access {
            current.has_filesystem_access = v;
        }
        if let Some(v) = update.reannounce_enabled {
            current.reannounce_enabled = v;
        }

        let res = self
            .db
            .execute(
                sqlx::query(
                    "UPDATE instances SET name = ?, base_url = ?, username = ?, \
                     password_cipher = ?, password_nonce = ?, basic_auth = ?, \
                     tls_skip_verify = ?, timeout_secs = ?, is_active = ?, \
                     supports_torrent_creation = ?, has_filesystem_access = ?, \
                     reannounce_enabled = ?, updated_at = ? WHERE id = ?",
                )
                .bind(&current.name)
                .bind(&current.base_url)
                .bind(&current.username)
                .bind(&current.password_cipher)
                .bind(&current.password_nonce)
                .bind(bool_to_int(current.basic_auth))
                .bind(bool_to_int(current.tls_skip_verify))
                .bind(current.timeout_secs)
                .bind(bool_to_int(current.is_active))
                .bind(bool_to_int(current.supports_torrent_creation))
                .bind(bool_to_int(current.has_filesystem_access))
                .bind(bool_to_int(current.reannounce_enabled))
                .bind(now_iso8601())
                .bind(id),
            )
            .await?;
        if res.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        self.get(id).await
    }

    /// Soft-deactivate: the instance stays configured but proxied requests
    /// for it return 502 and background work skips it.
    pub async fn deactivate(&self, id: i64) -> Result<(), StoreError> {
        let res = self
            .db
            .execute(
                sqlx::query("UPDATE instances SET is_active = 0, updated_at = ? WHERE id = ?")
                    .bind(now_iso8601())
                    .bind(id),
            )
            .await?;
        if res.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Decrypt the stored password. Plaintext must only flow into a
    /// short-lived proxy context or a login request.
    pub fn decrypted_password(&self, instance: &Instance) -> Result<Option<String>, StoreError> {
        match (&instance.password_cipher, &instance.password_nonce) {
            (Some(cipher), Some(nonce)) => {
                let plain = self
                    .encryption
                    .decrypt(cipher, nonce)
                    .context("decrypt instance password")?;
                Ok(Some(plain))
            }
            _ => Ok(None),
        }
    }
}

fn row_to_instance(row: &SqliteRow) -> anyhow::Result<Instance> {
    Ok(Instance {
        id: row.get("id"),
        name: row.get("name"),
        base_url: row.get("base_url"),
        username: row.get("username"),
        password_cipher: row.get("password_cipher"),
        password_nonce: row.get("password_nonce"),
        basic_auth: int_to_bool(row.get("basic_auth")),
        tls_skip_verify: int_to_bool(row.get("tls_skip_verify")),
        timeout_secs: row.get("timeout_secs"),
        is_active: int_to_bool(row.get("is_active")),
        supports_torrent_creation: int_to_bool(row.get("supports_torrent_creation")),
        has_filesystem_access: int_to_bool(row.get("has_filesystem_access")),
        reannounce_enabled: int_to_bool(row.get("reannounce_enabled")),
        created_at: str_to_datetime(row.get::<&str, _>("created_at"))?,
        updated_at: str_to_datetime(row.get::<&str, _>("updated_at"))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    use crate::metrics::Metrics;

    async fn store() -> (tempfile::TempDir, Arc<InstanceStore>) {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open(dir.path().join("gateway.db"), Metrics::new().unwrap())
            .await
            .unwrap();
        let enc = CredentialEncryption::from_base64_key(&CredentialEncryption::generate_key())
            .unwrap();
        (dir, InstanceStore::new(db, enc))
    }

    fn new_instance(name: &str) -> NewInstance {
        NewInstance {
            name: name.to_string(),
            base_url: "http://192.0.2.10:8080/qbittorrent".to_string(),
            username: Some("admin".to_string()),
            password: Some("hunter2".to_string()),
            basic_auth: false,
            tls_skip_verify: false,
            timeout_secs: None,
            supports_torrent_creation: false,
            has_filesystem_access: false,
            reannounce_enabled: true,
        }
    }

    #[tokio::test]
    async fn create_get_roundtrip_with_encrypted_password() {
        let (_dir, store) = store().await;

        let created = store.create(new_instance("main")).await.unwrap();
        assert!(created.is_active);
        assert_ne!(created.password_cipher.as_deref(), Some("hunter2"));

        let fetched = store.get(created.id).await.unwrap();
        assert_eq!(fetched.name, "main");
        assert_eq!(
            store.decrypted_password(&fetched).unwrap().as_deref(),
            Some("hunter2")
        );
    }

    #[tokio::test]
    async fn deactivate_is_soft() {
        let (_dir, store) = store().await;
        let created = store.create(new_instance("seedbox")).await.unwrap();

        store.deactivate(created.id).await.unwrap();
        let fetched = store.get(created.id).await.unwrap();
        assert!(!fetched.is_active);
    }

    #[tokio::test]
    async fn update_changes_only_given_fields() {
        let (_dir, store) = store().await;
        let created = store.create(new_instance("main")).await.unwrap();

        let updated = store
            .update(
                created.id,
                InstanceUpdate {
                    base_url: Some("http://192.0.2.11:9090".to_string()),
                    reannounce_enabled: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.base_url, "http://192.0.2.11:9090");
        assert!(!updated.reannounce_enabled);
        assert_eq!(updated.name, "main");
        assert_eq!(
            store.decrypted_password(&updated).unwrap().as_deref(),
            Some("hunter2")
        );
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let (_dir, store) = store().await;
        assert_matches!(store.get(404).await, Err(StoreError::NotFound));
    }
}
