//! Torrent filtering, sorting, and pagination for aggregator queries.

use std::cmp::Ordering;
use std::collections::HashMap;

use super::wire::Torrent;

/// Query parameters for `torrents_with_filters` / `search_torrents`.
/// Built by the proxy layer from allow-listed query strings; malformed
/// numeric values are dropped there, so defaults apply.
#[derive(Debug, Default, Clone)]
pub struct TorrentQuery {
    pub filter: Option<String>,
    pub category: Option<String>,
    pub tag: Option<String>,
    pub sort: Option<String>,
    pub reverse: bool,
    pub limit: Option<usize>,
    pub offset: usize,
    pub hashes: Vec<String>,
    pub search: Option<String>,
}

/// Apply a query to an instance's torrent map. Returns the matching
/// torrents (sorted, paginated) plus the pre-pagination match count.
pub fn select(torrents: &HashMap<String, Torrent>, query: &TorrentQuery) -> (Vec<Torrent>, usize) {
    let mut matched: Vec<Torrent> = torrents
        .values()
        .filter(|t| matches(t, query))
        .cloned()
        .collect();

    sort(&mut matched, query.sort.as_deref(), query.reverse);
    let total = matched.len();

    let tail: Vec<Torrent> = matched.into_iter().skip(query.offset).collect();
    let page = match query.limit {
        Some(limit) => tail.into_iter().take(limit).collect(),
        None => tail,
    };
    (page, total)
}

fn matches(torrent: &Torrent, query: &TorrentQuery) -> bool {
    if let Some(filter) = query.filter.as_deref() {
        if !matches_state_filter(filter, torrent) {
            return false;
        }
    }
    if let Some(category) = query.category.as_deref() {
        if torrent.category != category {
            return false;
        }
    }
    if let Some(tag) = query.tag.as_deref() {
        if !torrent.tag_list().iter().any(|t| *t == tag) {
            return false;
        }
    }
    if !query.hashes.is_empty()
        && !query
            .hashes
            .iter()
            .any(|h| h.eq_ignore_ascii_case(&torrent.hash))
    {
        return false;
    }
    if let Some(search) = query.search.as_deref() {
        let needle = search.to_lowercase();
        if !torrent.name.to_lowercase().contains(&needle)
            && !torrent.category.to_lowercase().contains(&needle)
            && !torrent.tags.to_lowercase().contains(&needle)
        {
            return false;
        }
    }
    true
}

/// qBittorrent state-filter groups. Unknown filters match everything,
/// matching upstream's forgiving behaviour.
fn matches_state_filter(filter: &str, torrent: &Torrent) -> bool {
    let state = torrent.state.as_str();
    match filter {
        "all" => true,
        "downloading" => matches!(
            state,
            "downloading"
                | "metaDL"
                | "stalledDL"
                | "checkingDL"
                | "pausedDL"
                | "stoppedDL"
                | "queuedDL"
                | "forcedDL"
                | "allocating"
        ),
        "seeding" => matches!(
            state,
            "uploading" | "stalledUP" | "checkingUP" | "queuedUP" | "forcedUP"
        ),
        "completed" => state.ends_with("UP"),
        "paused" | "stopped" => matches!(
            state,
            "pausedUP" | "pausedDL" | "stoppedUP" | "stoppedDL"
        ),
        "resumed" | "running" => !matches!(
            state,
            "pausedUP" | "pausedDL" | "stoppedUP" | "stoppedDL"
        ),
        "active" => torrent.dlspeed > 0 || torrent.upspeed > 0,
        "inactive" => torrent.dlspeed == 0 && torrent.upspeed == 0,
        "stalled" => matches!(state, "stalledUP" | "stalledDL"),
        "stalled_uploading" => state == "stalledUP",
        "stalled_downloading" => state == "stalledDL",
        "errored" => matches!(state, "error" | "missingFiles"),
        "checking" => matches!(state, "checkingUP" | "checkingDL" | "checkingResumeData"),
        "moving" => state == "moving",
        _ => true,
    }
}

fn sort(torrents: &mut [Torrent], key: Option<&str>, reverse: bool) {
    let cmp: fn(&Torrent, &Torrent) -> Ordering = match key.unwrap_or("added_on") {
        "name" => |a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()),
        "size" => |a, b| a.size.cmp(&b.size),
        "total_size" => |a, b| a.total_size.cmp(&b.total_size),
        "progress" => |a, b| a.progress.partial_cmp(&b.progress).unwrap_or(Ordering::Equal),
        "ratio" => |a, b| a.ratio.partial_cmp(&b.ratio).unwrap_or(Ordering::Equal),
        "dlspeed" => |a, b| a.dlspeed.cmp(&b.dlspeed),
        "upspeed" => |a, b| a.upspeed.cmp(&b.upspeed),
        "eta" => |a, b| a.eta.cmp(&b.eta),
        "num_seeds" => |a, b| a.num_seeds.cmp(&b.num_seeds),
        "num_leechs" => |a, b| a.num_leechs.cmp(&b.num_leechs),
        "category" => |a, b| a.category.cmp(&b.category),
        "state" => |a, b| a.state.cmp(&b.state),
        "priority" => |a, b| a.priority.cmp(&b.priority),
        "completion_on" => |a, b| a.completion_on.cmp(&b.completion_on),
        // Unknown sort keys fall back to insertion age.
        _ => |a, b| a.added_on.cmp(&b.added_on),
    };
    torrents.sort_by(|a, b| {
        // Hash as a stable tie-break so pagination never flickers.
        cmp(a, b).then_with(|| a.hash.cmp(&b.hash))
    });
    if reverse {
        torrents.reverse();
    }
}
