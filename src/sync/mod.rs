//! Instance state aggregator.
//!
//! Holds the per-instance torrent cache populated from captured
//! `sync/maindata` responses, answers the intercepted read endpoints
//! without touching upstream, and fetch-throughs per-hash detail
//! (properties, trackers, files) with a short TTL.

mod filters;
pub mod wire;

pub use filters::TorrentQuery;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::clients::ClientPool;
use crate::db::Db;
use crate::redact::redact_err;

use wire::{
    Category, MainData, SearchResult, Torrent, TorrentFileEntry, TorrentPeers,
    TorrentProperties, TorrentTracker,
};

/// TTL for fetch-through detail caches (properties, trackers, files).
const DETAIL_TTL: Duration = Duration::from_secs(60);

struct CachedFetch<T> {
    value: T,
    fetched_at: Instant,
}

impl<T: Clone> CachedFetch<T> {
    fn fresh(&self) -> Option<T> {
        (self.fetched_at.elapsed() < DETAIL_TTL).then(|| self.value.clone())
    }
}

#[derive(Default)]
struct InstanceState {
    torrents: HashMap<String, Torrent>,
    categories: HashMap<String, Category>,
    tags: Vec<String>,
    peers: HashMap<String, TorrentPeers>,
    properties: HashMap<String, CachedFetch<TorrentProperties>>,
    trackers: HashMap<String, CachedFetch<Vec<TorrentTracker>>>,
    files: HashMap<String, CachedFetch<Vec<TorrentFileEntry>>>,
}

pub struct SyncManager {
    db: Arc<Db>,
    pool: Arc<ClientPool>,
    states: RwLock<HashMap<i64, InstanceState>>,
}

impl SyncManager {
    pub fn new(db: Arc<Db>, pool: Arc<ClientPool>) -> Arc<Self> {
        Arc::new(Self {
            db,
            pool,
            states: RwLock::new(HashMap::new()),
        })
    }

    /// Replace an instance's snapshot with a full maindata update. Callers
    /// enforce the merge rule (full_update, or rid 0 with torrents present);
    /// incremental payloads must never reach this method.
    pub fn apply_main_data(&self, instance_id: i64, md: &MainData) {
        let mut states = self.states.write();
        let state = states.entry(instance_id).or_default();

        state.torrents = md
            .torrents
            .iter()
            .map(|(hash, torrent)| {
                let mut torrent = torrent.clone();
                if torrent.hash.is_empty() {
                    torrent.hash = hash.clone();
                }
                (hash.clone(), torrent)
            })
            .collect();
        state.categories = md
            .categories
            .iter()
            .map(|(name, cat)| {
                let mut cat = cat.clone();
                if cat.name.is_empty() {
                    cat.name = name.clone();
                }
                (name.clone(), cat)
            })
            .collect();
        state.tags = md.tags.clone();
        drop(states);

        debug!(
            instance_id,
            torrents = md.torrents.len(),
            "applied full maindata snapshot"
        );
        self.spawn_catalog_persist(instance_id);
    }

    /// Store a full peers snapshot for one torrent.
    pub fn apply_peers_data(&self, instance_id: i64, hash: &str, peers: &TorrentPeers) {
        let mut states = self.states.write();
        states
            .entry(instance_id)
            .or_default()
            .peers
            .insert(hash.to_uppercase(), peers.clone());
    }

    /// True once a full snapshot has been merged for this instance.
    pub fn has_state(&self, instance_id: i64) -> bool {
        self.states.read().contains_key(&instance_id)
    }

    pub fn torrents_with_filters(&self, instance_id: i64, query: &TorrentQuery) -> Vec<Torrent> {
        let states = self.states.read();
        match states.get(&instance_id) {
            Some(state) => filters::select(&state.torrents, query).0,
            None => Vec::new(),
        }
    }

    pub fn search_torrents(&self, instance_id: i64, query: &TorrentQuery) -> SearchResult {
        let states = self.states.read();
        match states.get(&instance_id) {
            Some(state) => {
                let (torrents, total) = filters::select(&state.torrents, query);
                SearchResult { torrents, total }
            }
            None => SearchResult {
                torrents: Vec::new(),
                total: 0,
            },
        }
    }

    pub fn categories(&self, instance_id: i64) -> HashMap<String, Category> {
        self.states
            .read()
            .get(&instance_id)
            .map(|s| s.categories.clone())
            .unwrap_or_default()
    }

    pub fn tags(&self, instance_id: i64) -> Vec<String> {
        self.states
            .read()
            .get(&instance_id)
            .map(|s| s.tags.clone())
            .unwrap_or_default()
    }

    pub fn torrent_peers(&self, instance_id: i64, hash: &str) -> Option<TorrentPeers> {
        self.states
            .read()
            .get(&instance_id)
            .and_then(|s| s.peers.get(&hash.to_uppercase()).cloned())
    }

    pub async fn torrent_properties(
        &self,
        instance_id: i64,
        hash: &str,
    ) -> Result<TorrentProperties> {
        let key = hash.to_uppercase();
        if let Some(cached) = self
            .states
            .read()
            .get(&instance_id)
            .and_then(|s| s.properties.get(&key))
            .and_then(CachedFetch::fresh)
        {
            return Ok(cached);
        }

        let client = self.pool.get_client(instance_id).await?;
        let props: TorrentProperties = client
            .get_json("/api/v2/torrents/properties", &[("hash", hash)])
            .await
            .context("fetch torrent properties")?;

        self.states
            .write()
            .entry(instance_id)
            .or_default()
            .properties
            .insert(
                key,
                CachedFetch {
                    value: props.clone(),
                    fetched_at: Instant::now(),
                },
            );
        Ok(props)
    }

    pub async fn torrent_trackers(
        &self,
        instance_id: i64,
        hash: &str,
    ) -> Result<Vec<TorrentTracker>> {
        let key = hash.to_uppercase();
        if let Some(cached) = self
            .states
            .read()
            .get(&instance_id)
            .and_then(|s| s.trackers.get(&key))
            .and_then(CachedFetch::fresh)
        {
            return Ok(cached);
        }

        let client = self.pool.get_client(instance_id).await?;
        let trackers: Vec<TorrentTracker> = client
            .get_json("/api/v2/torrents/trackers", &[("hash", hash)])
            .await
            .context("fetch torrent trackers")?;

        self.states
            .write()
            .entry(instance_id)
            .or_default()
            .trackers
            .insert(
                key,
                CachedFetch {
                    value: trackers.clone(),
                    fetched_at: Instant::now(),
                },
            );
        Ok(trackers)
    }

    /// Files for a torrent, optionally restricted to specific file indexes.
    pub async fn torrent_files(
        &self,
        instance_id: i64,
        hash: &str,
        indexes: Option<&[i64]>,
    ) -> Result<Vec<TorrentFileEntry>> {
        let key = hash.to_uppercase();
        let cached = self
            .states
            .read()
            .get(&instance_id)
            .and_then(|s| s.files.get(&key))
            .and_then(CachedFetch::fresh);

        let files = match cached {
            Some(files) => files,
            None => {
                let client = self.pool.get_client(instance_id).await?;
                let files: Vec<TorrentFileEntry> = client
                    .get_json("/api/v2/torrents/files", &[("hash", hash)])
                    .await
                    .context("fetch torrent files")?;
                self.states
                    .write()
                    .entry(instance_id)
                    .or_default()
                    .files
                    .insert(
                        key,
                        CachedFetch {
                            value: files.clone(),
                            fetched_at: Instant::now(),
                        },
                    );
                files
            }
        };

        Ok(match indexes {
            Some(indexes) => files
                .into_iter()
                .filter(|f| indexes.contains(&f.index))
                .collect(),
            None => files,
        })
    }

    /// Drop cached per-hash detail after a mutating endpoint touched the
    /// torrent. The next read fetches fresh data.
    pub fn invalidate_file_cache(&self, instance_id: i64, hash: &str) {
        let key = hash.to_uppercase();
        let mut states = self.states.write();
        if let Some(state) = states.get_mut(&instance_id) {
            state.files.remove(&key);
            state.properties.remove(&key);
            state.trackers.remove(&key);
        }
    }

    /// Persist the instance's category and tag names through the string
    /// pool, for cross-instance dashboards. Best-effort.
    fn spawn_catalog_persist(&self, instance_id: i64) {
        let db = self.db.clone();
        let (categories, tags) = {
            let states = self.states.read();
            match states.get(&instance_id) {
                Some(s) => (
                    s.categories.values().cloned().collect::<Vec<_>>(),
                    s.tags.clone(),
                ),
                None => return,
            }
        };
        tokio::spawn(async move {
            if let Err(err) = persist_catalog(&db, instance_id, &categories, &tags).await {
                warn!(
                    instance_id,
                    error = %redact_err(&err),
                    "failed to persist instance catalog"
                );
            }
        });
    }
}

async fn persist_catalog(
    db: &Db,
    instance_id: i64,
    categories: &[Category],
    tags: &[String],
) -> Result<()> {
    // Intern outside the transaction: the interning statements take the
    // writer mutex themselves. Orphans from a failed transaction are
    // reclaimed by the periodic string-pool sweep.
    let mut category_rows = Vec::with_capacity(categories.len());
    for cat in categories {
        let name_id = db.intern_string(&cat.name).await?;
        let save_path_id = if cat.save_path.is_empty() {
            None
        } else {
            Some(db.intern_string(&cat.save_path).await?)
        };
        category_rows.push((name_id, save_path_id));
    }
    let mut tag_ids = Vec::with_capacity(tags.len());
    for tag in tags {
        tag_ids.push(db.intern_string(tag).await?);
    }

    let mut tx = db.begin(false).await?;
    tx.execute(sqlx::query("DELETE FROM instance_categories WHERE instance_id = ?").bind(instance_id))
        .await?;
    tx.execute(sqlx::query("DELETE FROM instance_tags WHERE instance_id = ?").bind(instance_id))
        .await?;
    for (name_id, save_path_id) in category_rows {
        tx.execute(
            sqlx::query(
                "INSERT INTO instance_categories (instance_id, name_id, save_path_id) VALUES (?, ?, ?)",
            )
            .bind(instance_id)
            .bind(name_id)
            .bind(save_path_id),
        )
        .await?;
    }
    for tag_id in tag_ids {
        tx.execute(
            sqlx::query("INSERT INTO instance_tags (instance_id, tag_id) VALUES (?, ?)")
                .bind(instance_id)
                .bind(tag_id),
        )
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    use crate::crypto::CredentialEncryption;
    use crate::metrics::Metrics;
    use crate::stores::InstanceStore;

    async fn manager() -> (tempfile::TempDir, Arc<SyncManager>) {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open(dir.path().join("gateway.db"), Metrics::new().unwrap())
            .await
            .unwrap();
        let enc = CredentialEncryption::from_base64_key(&CredentialEncryption::generate_key())
            .unwrap();
        let instances = InstanceStore::new(db.clone(), enc);
        let pool = ClientPool::new(instances).unwrap();
        (dir, SyncManager::new(db, pool))
    }

    fn maindata_with(hash: &str, name: &str) -> MainData {
        let mut md = MainData {
            rid: 0,
            full_update: true,
            ..Default::default()
        };
        md.torrents.insert(
            hash.to_string(),
            Torrent {
                name: name.to_string(),
                state: "downloading".to_string(),
                ..Default::default()
            },
        );
        md.tags = vec!["cross-seed".to_string()];
        md
    }

    #[tokio::test]
    async fn full_snapshot_replaces_state_and_fills_hashes() {
        let (_dir, sync) = manager().await;

        sync.apply_main_data(7, &maindata_with("ABCD", "linux.iso"));
        let torrents = sync.torrents_with_filters(7, &TorrentQuery::default());
        assert_eq!(torrents.len(), 1);
        assert_eq!(torrents[0].hash, "ABCD");
        assert_eq!(torrents[0].name, "linux.iso");

        // A later snapshot replaces, not merges.
        sync.apply_main_data(7, &maindata_with("EF01", "ubuntu.iso"));
        let torrents = sync.torrents_with_filters(7, &TorrentQuery::default());
        assert_eq!(torrents.len(), 1);
        assert_eq!(torrents[0].hash, "EF01");
    }

    #[tokio::test]
    async fn unknown_instance_reads_empty() {
        let (_dir, sync) = manager().await;
        assert!(sync.torrents_with_filters(1, &TorrentQuery::default()).is_empty());
        assert!(sync.categories(1).is_empty());
        assert!(sync.tags(1).is_empty());
        assert_eq!(sync.search_torrents(1, &TorrentQuery::default()).total, 0);
    }

    #[tokio::test]
    async fn peers_are_keyed_by_uppercase_hash() {
        let (_dir, sync) = manager().await;
        let peers = TorrentPeers {
            rid: 1,
            full_update: true,
            ..Default::default()
        };
        sync.apply_peers_data(3, "abcd", &peers);
        assert!(sync.torrent_peers(3, "ABCD").is_some());
        assert!(sync.torrent_peers(3, "abcd").is_some());
        assert!(sync.torrent_peers(3, "ffff").is_none());
    }

    #[tokio::test]
    async fn invalidate_drops_detail_caches() {
        let (_dir, sync) = manager().await;
        sync.states.write().entry(9).or_default().files.insert(
            "ABCD".to_string(),
            CachedFetch {
                value: vec![TorrentFileEntry::default()],
                fetched_at: Instant::now(),
            },
        );
        sync.invalidate_file_cache(9, "ABCD");
        assert!(
            sync.states
                .read()
                .get(&9)
                .is_none_or(|s| !s.files.contains_key("ABCD"))
        );
    }
}
