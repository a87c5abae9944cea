//! Prepared-statement cache, one per connection pool.
//!
//! Entries are keyed by SQL text and evicted after five idle minutes. A
//! statement prepared on the writer pool is never handed to the reader pool
//! (and vice versa); each pool owns its own cache.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use sqlx::sqlite::SqliteStatement;

/// Idle TTL for a cached statement.
pub const STATEMENT_TTL: Duration = Duration::from_secs(5 * 60);

struct CacheEntry {
    stmt: Arc<SqliteStatement<'static>>,
    /// Milliseconds since the cache epoch; updated on every hit so the
    /// sweeper can take the read-free path.
    last_used_ms: AtomicU64,
}

/// SQL text → prepared statement. Reads take the read side of the lock;
/// eviction and `clear` take the write side.
pub struct StatementCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
    epoch: Instant,
}

impl StatementCache {
    pub fn new(ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            epoch: Instant::now(),
        })
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Look up a statement and refresh its idle clock.
    pub fn get(&self, sql: &str) -> Option<Arc<SqliteStatement<'static>>> {
        let entries = self.entries.read();
        let entry = entries.get(sql)?;
        entry.last_used_ms.store(self.now_ms(), Ordering::Relaxed);
        Some(entry.stmt.clone())
    }

    /// Insert a freshly prepared statement. Two tasks may race to prepare
    /// the same text; the loser's handle is simply dropped when replaced.
    pub fn insert(
        &self,
        sql: &str,
        stmt: SqliteStatement<'static>,
    ) -> Arc<SqliteStatement<'static>> {
        let stmt = Arc::new(stmt);
        self.entries.write().insert(
            sql.to_owned(),
            CacheEntry {
                stmt: stmt.clone(),
                last_used_ms: AtomicU64::new(self.now_ms()),
            },
        );
        stmt
    }

    pub fn remove(&self, sql: &str) {
        self.entries.write().remove(sql);
    }

    /// Drop every entry idle longer than the TTL. Returns how many were
    /// evicted. In-flight executors keep their handle alive through the
    /// `Arc`; it closes when the last user drops it.
    pub fn evict_idle(&self) -> usize {
        let cutoff = self.now_ms().saturating_sub(self.ttl.as_millis() as u64);
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| e.last_used_ms.load(Ordering::Relaxed) >= cutoff);
        before - entries.len()
    }

    /// Drop everything. Called before the owning pool closes.
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    #[cfg(test)]
    pub(crate) fn backdate(&self, sql: &str, age: Duration) {
        let entries = self.entries.read();
        if let Some(entry) = entries.get(sql) {
            let now = self.now_ms();
            entry
                .last_used_ms
                .store(now.saturating_sub(age.as_millis() as u64), Ordering::Relaxed);
        }
    }
}
