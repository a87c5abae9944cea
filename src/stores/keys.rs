//! Downstream API-key store.
//!
//! Keys are stored as SHA-256 hashes. `last_used_at` writes are debounced:
//! at most one update per key every ten seconds, with the debounce registry
//! swept once a minute.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::crypto::{generate_api_key, hash_api_key};
use crate::db::Db;
use crate::db::helpers::{now_iso8601, str_to_datetime, str_to_datetime_opt};
use crate::models::DownstreamKey;

use super::StoreError;

/// Minimum gap between two `last_used_at` writes for the same key.
const LAST_USED_DEBOUNCE: Duration = Duration::from_secs(10);
/// Debouncer entries idle longer than this are dropped by the sweep.
const DEBOUNCE_IDLE: Duration = Duration::from_secs(5 * 60);
const DEBOUNCE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

const KEY_COLUMNS: &str = "id, client_name, key_hash, instance_id, last_used_at, created_at";

/// Result of creating a key: the plaintext is returned exactly once.
pub struct CreatedKey {
    pub key: DownstreamKey,
    pub plaintext: String,
}

pub struct KeyStore {
    db: Arc<Db>,
    /// key_hash → last time we wrote last_used_at.
    debounce: Mutex<HashMap<String, Instant>>,
    shutdown: CancellationToken,
}

impl KeyStore {
    pub fn new(db: Arc<Db>) -> Arc<Self> {
        let store = Arc::new(Self {
            db,
            debounce: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        });
        store.spawn_sweeper();
        store
    }

    /// Resolve a presented API key to its entity, or `NotFound`.
    pub async fn validate_key(&self, api_key: &str) -> Result<DownstreamKey, StoreError> {
        let hash = hash_api_key(api_key);
        let sql = format!("SELECT {KEY_COLUMNS} FROM downstream_keys WHERE key_hash = ?");
        let row = self
            .db
            .fetch_optional(sqlx::query(&sql).bind(&hash))
            .await?
            .ok_or(StoreError::NotFound)?;
        row_to_key(&row).map_err(Into::into)
    }

    /// Record key usage, at most once per ten seconds per key. The write
    /// itself is best-effort.
    pub async fn touch_last_used(&self, key_hash: &str) {
        {
            let mut debounce = self.debounce.lock();
            match debounce.get(key_hash) {
                Some(last) if last.elapsed() < LAST_USED_DEBOUNCE => return,
                _ => {
                    debounce.insert(key_hash.to_owned(), Instant::now());
                }
            }
        }

        if let Err(err) = self
            .db
            .execute(
                sqlx::query("UPDATE downstream_keys SET last_used_at = ? WHERE key_hash = ?")
                    .bind(now_iso8601())
                    .bind(key_hash),
            )
            .await
        {
            warn!(error = %err, "failed to update key last_used_at");
        }
    }

    pub async fn list(&self) -> Result<Vec<DownstreamKey>, StoreError> {
        let sql = format!("SELECT {KEY_COLUMNS} FROM downstream_keys ORDER BY client_name");
        let rows = self.db.fetch_all(sqlx::query(&sql)).await?;
        rows.iter().map(|r| row_to_key(r).map_err(Into::into)).collect()
    }

    /// Issue a key for `client_name` against `instance_id`. The plaintext
    /// key is shown once and never persisted.
    pub async fn create(
        &self,
        client_name: &str,
        instance_id: i64,
    ) -> Result<CreatedKey, StoreError> {
        let plaintext = generate_api_key();
        let hash = hash_api_key(&plaintext);
        let sql = format!(
            "INSERT INTO downstream_keys (client_name, key_hash, instance_id, created_at) \
             VALUES (?, ?, ?, ?) RETURNING {KEY_COLUMNS}"
        );
        let row = self
            .db
            .fetch_optional(
                sqlx::query(&sql)
                    .bind(client_name)
                    .bind(&hash)
                    .bind(instance_id)
                    .bind(now_iso8601()),
            )
            .await?
            .ok_or(StoreError::NotFound)?;
        Ok(CreatedKey {
            key: row_to_key(&row)?,
            plaintext,
        })
    }

    pub async fn delete(&self, id: i64) -> Result<(), StoreError> {
        let res = self
            .db
            .execute(sqlx::query("DELETE FROM downstream_keys WHERE id = ?").bind(id))
            .await?;
        if res.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    fn spawn_sweeper(self: &Arc<Self>) {
        let store = Arc::downgrade(self);
        let token = self.shutdown.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(DEBOUNCE_SWEEP_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tick.tick() => {}
                }
                let Some(store) = store.upgrade() else { break };
                let mut debounce = store.debounce.lock();
                let before = debounce.len();
                debounce.retain(|_, last| last.elapsed() < DEBOUNCE_IDLE);
                let removed = before - debounce.len();
                if removed > 0 {
                    debug!(removed, "swept idle key debounce entries");
                }
            }
        });
    }

    #[cfg(test)]
    pub(crate) fn debounce_len(&self) -> usize {
        self.debounce.lock().len()
    }
}

fn row_to_key(row: &SqliteRow) -> anyhow::Result<DownstreamKey> {
    Ok(DownstreamKey {
        id: row.get("id"),
        client_name: row.get("client_name"),
        key_hash: row.get("key_hash"),
        instance_id: row.get("instance_id"),
        last_used_at: str_to_datetime_opt(row.get::<Option<&str>, _>("last_used_at"))?,
        created_at: str_to_datetime(row.get::<&str, _>("created_at"))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    use crate::metrics::Metrics;

    async fn fixture() -> (tempfile::TempDir, Arc<Db>, Arc<KeyStore>) {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open(dir.path().join("gateway.db"), Metrics::new().unwrap())
            .await
            .unwrap();
        db.execute(
            sqlx::query(
                "INSERT INTO instances (name, base_url, created_at, updated_at) VALUES (?, ?, ?, ?)",
            )
            .bind("main")
            .bind("http://localhost:8080")
            .bind(now_iso8601())
            .bind(now_iso8601()),
        )
        .await
        .unwrap();
        let store = KeyStore::new(db.clone());
        (dir, db, store)
    }

    #[tokio::test]
    async fn create_then_validate() {
        let (_dir, _db, store) = fixture().await;

        let created = store.create("cross-seed", 1).await.unwrap();
        assert_eq!(created.plaintext.len(), 64);
        assert_eq!(created.key.client_name, "cross-seed");
        assert_eq!(created.key.instance_id, 1);
        assert!(created.key.last_used_at.is_none());

        let validated = store.validate_key(&created.plaintext).await.unwrap();
        assert_eq!(validated.id, created.key.id);
    }

    #[tokio::test]
    async fn unknown_key_is_not_found() {
        let (_dir, _db, store) = fixture().await;
        assert_matches!(
            store.validate_key("does-not-exist").await,
            Err(StoreError::NotFound)
        );
    }

    #[tokio::test]
    async fn touch_is_debounced_per_key() {
        let (_dir, db, store) = fixture().await;
        let created = store.create("radarr", 1).await.unwrap();

        store.touch_last_used(&created.key.key_hash).await;
        let first = store
            .validate_key(&created.plaintext)
            .await
            .unwrap()
            .last_used_at
            .expect("first touch persisted");

        // Within the window: no second write.
        store.touch_last_used(&created.key.key_hash).await;
        let second = store
            .validate_key(&created.plaintext)
            .await
            .unwrap()
            .last_used_at
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(store.debounce_len(), 1);

        // Unknown hashes never panic, just miss.
        store.touch_last_used("ffff").await;
        let _ = db;
    }
}
