//! qBittorrent Web API wire types.
//!
//! Everything carries serde defaults: maindata payloads are partial by
//! design and fields drift between qBittorrent releases.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// `GET /api/v2/sync/maindata` payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MainData {
    pub rid: i64,
    pub full_update: bool,
    pub torrents: HashMap<String, Torrent>,
    pub torrents_removed: Vec<String>,
    pub categories: HashMap<String, Category>,
    pub categories_removed: Vec<String>,
    pub tags: Vec<String>,
    pub tags_removed: Vec<String>,
    pub server_state: serde_json::Value,
}

/// One torrent as qBittorrent reports it in `torrents/info` and maindata.
/// In maindata the hash is the map key; [MainData] merges copy it in.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Torrent {
    pub added_on: i64,
    pub amount_left: i64,
    pub category: String,
    pub completed: i64,
    pub completion_on: i64,
    pub dlspeed: i64,
    pub dl_limit: i64,
    pub downloaded: i64,
    pub eta: i64,
    pub force_start: bool,
    pub hash: String,
    pub last_activity: i64,
    pub name: String,
    pub num_complete: i64,
    pub num_incomplete: i64,
    pub num_leechs: i64,
    pub num_seeds: i64,
    pub priority: i64,
    pub progress: f64,
    pub ratio: f64,
    pub save_path: String,
    pub size: i64,
    pub state: String,
    /// Comma-separated list, as upstream serialises it.
    pub tags: String,
    pub time_active: i64,
    pub total_size: i64,
    pub tracker: String,
    pub up_limit: i64,
    pub uploaded: i64,
    pub upspeed: i64,
}

impl Torrent {
    pub fn tag_list(&self) -> Vec<&str> {
        self.tags
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .collect()
    }
}

/// Category entry (`torrents/categories`, maindata `categories`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Category {
    pub name: String,
    #[serde(rename = "savePath")]
    pub save_path: String,
}

/// `GET /api/v2/torrents/properties` payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TorrentProperties {
    pub save_path: String,
    pub creation_date: i64,
    pub piece_size: i64,
    pub comment: String,
    pub total_wasted: i64,
    pub total_uploaded: i64,
    pub total_downloaded: i64,
    pub up_limit: i64,
    pub dl_limit: i64,
    pub time_elapsed: i64,
    pub seeding_time: i64,
    pub nb_connections: i64,
    pub nb_connections_limit: i64,
    pub share_ratio: f64,
    pub addition_date: i64,
    pub completion_date: i64,
    pub created_by: String,
    pub dl_speed: i64,
    pub dl_speed_avg: i64,
    pub eta: i64,
    pub last_seen: i64,
    pub peers: i64,
    pub peers_total: i64,
    pub pieces_have: i64,
    pub pieces_num: i64,
    pub reannounce: i64,
    pub seeds: i64,
    pub seeds_total: i64,
    pub total_size: i64,
    pub up_speed: i64,
    pub up_speed_avg: i64,
}

/// One tracker row from `torrents/trackers`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TorrentTracker {
    pub url: String,
    pub status: i64,
    pub tier: i64,
    pub num_peers: i64,
    pub num_seeds: i64,
    pub num_leeches: i64,
    pub num_downloaded: i64,
    pub msg: String,
}

/// One file row from `torrents/files`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TorrentFileEntry {
    pub index: i64,
    pub name: String,
    pub size: i64,
    pub progress: f64,
    pub priority: i64,
    pub is_seed: Option<bool>,
    pub piece_range: Vec<i64>,
    pub availability: f64,
}

/// `GET /api/v2/sync/torrentPeers` payload, keyed by torrent hash upstream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TorrentPeers {
    pub rid: i64,
    pub full_update: bool,
    pub peers: HashMap<String, serde_json::Value>,
    pub show_flags: bool,
}

/// Envelope returned by the gateway's `torrents/search` intercept.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub torrents: Vec<Torrent>,
    pub total: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn maindata_parses_partial_payloads() {
        let md: MainData = serde_json::from_str(
            r#"{"rid":0,"full_update":true,"torrents":{"ABCD":{"name":"linux.iso","state":"downloading","progress":0.5}}}"#,
        )
        .unwrap();
        assert_eq!(md.rid, 0);
        assert!(md.full_update);
        assert_eq!(md.torrents.len(), 1);
        assert_eq!(md.torrents["ABCD"].name, "linux.iso");
        assert!(md.categories.is_empty());
    }

    #[test]
    fn incremental_maindata_defaults_full_update_off() {
        let md: MainData = serde_json::from_str(r#"{"rid":7}"#).unwrap();
        assert_eq!(md.rid, 7);
        assert!(!md.full_update);
        assert!(md.torrents.is_empty());
    }

    #[test]
    fn tag_list_splits_and_trims() {
        let torrent = Torrent {
            tags: "tv, cross-seed ,".to_string(),
            ..Default::default()
        };
        assert_eq!(torrent.tag_list(), vec!["tv", "cross-seed"]);
    }

    #[test]
    fn category_uses_upstream_save_path_key() {
        let cat: Category =
            serde_json::from_str(r#"{"name":"movies","savePath":"/data/movies"}"#).unwrap();
        assert_eq!(cat.save_path, "/data/movies");
        assert!(serde_json::to_string(&cat).unwrap().contains("savePath"));
    }
}
