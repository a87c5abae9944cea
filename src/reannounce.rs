//! In-process reannounce claim registry.
//!
//! The monitoring worker registers hashes it watches; the proxy's
//! reannounce intercept asks this service to claim them so downstream tools
//! and the worker don't hammer trackers with duplicate reannounces. Claimed
//! hashes are stripped from the forwarded request.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

#[derive(Default)]
struct ReannounceState {
    /// Instances with reannounce monitoring switched on.
    enabled: HashSet<i64>,
    /// instance id → hashes currently under active monitoring.
    monitored: HashMap<i64, HashSet<String>>,
}

pub struct ReannounceService {
    state: Mutex<ReannounceState>,
}

impl ReannounceService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ReannounceState::default()),
        })
    }

    pub fn set_enabled(&self, instance_id: i64, enabled: bool) {
        let mut state = self.state.lock();
        if enabled {
            state.enabled.insert(instance_id);
        } else {
            state.enabled.remove(&instance_id);
            state.monitored.remove(&instance_id);
        }
    }

    pub fn is_enabled(&self, instance_id: i64) -> bool {
        self.state.lock().enabled.contains(&instance_id)
    }

    /// Register hashes the monitor is watching. Expects normalised
    /// (upper-case) hashes.
    pub fn track(&self, instance_id: i64, hashes: &[String]) {
        let mut state = self.state.lock();
        let monitored = state.monitored.entry(instance_id).or_default();
        for hash in hashes {
            monitored.insert(hash.clone());
        }
    }

    pub fn untrack(&self, instance_id: i64, hash: &str) {
        let mut state = self.state.lock();
        if let Some(monitored) = state.monitored.get_mut(&instance_id) {
            monitored.remove(hash);
        }
    }

    /// Claim the subset of `hashes` this service is already monitoring.
    /// The caller forwards only the unclaimed remainder upstream.
    pub fn request_reannounce(&self, instance_id: i64, hashes: &[String]) -> Vec<String> {
        let state = self.state.lock();
        if !state.enabled.contains(&instance_id) {
            return Vec::new();
        }
        let Some(monitored) = state.monitored.get(&instance_id) else {
            return Vec::new();
        };
        let claimed: Vec<String> = hashes
            .iter()
            .filter(|h| monitored.contains(*h))
            .cloned()
            .collect();
        if !claimed.is_empty() {
            debug!(instance_id, claimed = claimed.len(), "claimed reannounce hashes");
        }
        claimed
    }
}

/// Normalise a pipe-delimited hash list: trim, upper-case, dedupe keeping
/// first occurrence.
pub fn normalise_hashes(raw: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    raw.split('|')
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .map(str::to_uppercase)
        .filter(|h| seen.insert(h.clone()))
        .collect()
}
