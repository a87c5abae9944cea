//! Single-writer / many-reader SQLite engine.
//!
//! One writer connection (pool capped at 1, lifetime disabled) takes every
//! statement that mutates, serialised by a process-wide mutex so the driver
//! never sees a nested `BEGIN`. A read-only pool serves everything else.
//! Prepared statements are cached per pool, keyed by SQL text, and survive
//! transaction boundaries via post-commit promotion.

pub mod helpers;
mod migrate;
mod stmt_cache;
mod string_pool;
mod tx;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use sqlx::sqlite::{
    Sqlite, SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePool,
    SqlitePoolOptions, SqliteQueryResult, SqliteRow, SqliteStatement, SqliteSynchronous,
};
use sqlx::{Execute, Executor, Statement};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::metrics::Metrics;
pub use stmt_cache::{STATEMENT_TTL, StatementCache};
pub use tx::Tx;

/// Budget for pragma application and the initial WAL checkpoint.
const OPEN_TIMEOUT: Duration = Duration::from_secs(5);
/// Upper bound on reader connections; at least five stay idle and warm.
const READER_MAX_CONNECTIONS: u32 = 32;
const READER_MIN_CONNECTIONS: u32 = 5;
/// How often idle prepared statements are swept.
const STATEMENT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
/// String-pool cleanup cadence.
const CLEANUP_INITIAL_DELAY: Duration = Duration::from_secs(60 * 60);
const CLEANUP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
const CLEANUP_FAILURE_THRESHOLD: u32 = 5;

#[derive(Debug, Error)]
pub enum DbError {
    /// The writer connection was already inside a driver-level transaction
    /// at `begin`. This is a bug indicator, never retried.
    #[error("writer connection wedged: {0}")]
    Wedged(#[source] sqlx::Error),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error("failed to encode query arguments: {0}")]
    Arguments(sqlx::error::BoxDynError),

    #[error("migration {name} failed: {source}")]
    Migration {
        name: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("database is closed")]
    Closed,

    #[error("database open timed out")]
    OpenTimeout,

    #[error("database i/o setup failed: {0}")]
    Io(#[from] std::io::Error),
}

/// The database handle. Owns both pools and both statement caches; closing
/// it closes every cached handle exactly once.
pub struct Db {
    writer: SqlitePool,
    reader: SqlitePool,
    write_lock: Arc<Mutex<()>>,
    writer_stmts: Arc<StatementCache>,
    reader_stmts: Arc<StatementCache>,
    metrics: Arc<Metrics>,
    string_pool_deleted: AtomicU64,
    cleanup_running: AtomicBool,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl Db {
    /// Open (creating if missing) the database at `path`, apply pragmas, run
    /// an initial WAL checkpoint, and apply pending migrations. Background
    /// maintenance (statement sweep, string-pool cleanup) starts immediately.
    pub async fn open(path: impl AsRef<Path>, metrics: Arc<Metrics>) -> Result<Arc<Self>, DbError> {
        let path: PathBuf = path.as_ref().to_owned();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o755))?;
            }
        }

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .max_lifetime(None)
            .idle_timeout(None)
            .connect_with(writer_options(&path))
            .await?;

        // Truncate the WAL once at startup so a previous unclean shutdown
        // doesn't leave an unbounded log behind.
        tokio::time::timeout(
            OPEN_TIMEOUT,
            sqlx::raw_sql("PRAGMA wal_checkpoint(TRUNCATE)").execute(&writer),
        )
        .await
        .map_err(|_| DbError::OpenTimeout)??;

        migrate::run(&writer).await?;

        let reader = SqlitePoolOptions::new()
            .max_connections(READER_MAX_CONNECTIONS)
            .min_connections(READER_MIN_CONNECTIONS)
            .connect_with(reader_options(&path))
            .await?;

        let db = Arc::new(Self {
            writer,
            reader,
            write_lock: Arc::new(Mutex::new(())),
            writer_stmts: StatementCache::new(STATEMENT_TTL),
            reader_stmts: StatementCache::new(STATEMENT_TTL),
            metrics,
            string_pool_deleted: AtomicU64::new(0),
            cleanup_running: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        });

        db.spawn_maintenance();
        info!(path = %path.display(), "database open");
        Ok(db)
    }

    /// Execute a statement. Writes run on the writer connection under the
    /// process mutex; reads run on the reader pool.
    pub async fn execute<'q, E>(&self, query: E) -> Result<SqliteQueryResult, DbError>
    where
        E: Execute<'q, Sqlite>,
    {
        self.ensure_open()?;
        let mut query = query;
        let sql = query.sql().to_owned();
        let args = query.take_arguments().map_err(DbError::Arguments)?;
        if is_write_query(&sql) {
            let _guard = self.write_lock.lock().await;
            self.execute_on(&self.writer, &self.writer_stmts, &sql, args)
                .await
        } else {
            self.execute_on(&self.reader, &self.reader_stmts, &sql, args)
                .await
        }
    }

    /// Fetch every row of a query.
    pub async fn fetch_all<'q, E>(&self, query: E) -> Result<Vec<SqliteRow>, DbError>
    where
        E: Execute<'q, Sqlite>,
    {
        self.ensure_open()?;
        let mut query = query;
        let sql = query.sql().to_owned();
        let args = query.take_arguments().map_err(DbError::Arguments)?;
        if is_write_query(&sql) {
            let _guard = self.write_lock.lock().await;
            self.fetch_all_on(&self.writer, &self.writer_stmts, &sql, args)
                .await
        } else {
            self.fetch_all_on(&self.reader, &self.reader_stmts, &sql, args)
                .await
        }
    }

    /// Fetch at most one row. `Ok(None)` means the query matched nothing.
    pub async fn fetch_optional<'q, E>(&self, query: E) -> Result<Option<SqliteRow>, DbError>
    where
        E: Execute<'q, Sqlite>,
    {
        let mut rows = self.fetch_all(query).await?;
        Ok(if rows.is_empty() {
            None
        } else {
            Some(rows.swap_remove(0))
        })
    }

    /// Start a transaction. A write transaction holds the process-wide
    /// writer mutex for its entire lifetime; the guard is released exactly
    /// once, on commit or rollback (or drop).
    pub async fn begin(&self, read_only: bool) -> Result<Tx, DbError> {
        self.ensure_open()?;
        if read_only {
            let inner = self.reader.begin().await?;
            return Ok(Tx::new(
                inner,
                None,
                self.reader.clone(),
                self.reader_stmts.clone(),
            ));
        }

        let guard = self.write_lock.clone().lock_owned().await;
        match self.writer.begin().await {
            Ok(inner) => Ok(Tx::new(
                inner,
                Some(guard),
                self.writer.clone(),
                self.writer_stmts.clone(),
            )),
            Err(err) if is_wedged_error(&err) => {
                // Not transient: the writer connection was left inside a
                // transaction at the driver level. Surface loudly.
                self.metrics.db_wedged_transactions.inc();
                let backtrace = std::backtrace::Backtrace::force_capture();
                error!(
                    error = %err,
                    %backtrace,
                    "writer connection wedged: transaction within a transaction"
                );
                Err(DbError::Wedged(err))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Close both pools. Idempotent; caches are dropped before connections.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();
        self.writer_stmts.clear();
        self.reader_stmts.clear();
        // `optimize_on_close` on the writer options runs `PRAGMA optimize`
        // as each connection shuts down.
        self.writer.close().await;
        self.reader.close().await;
        info!("database closed");
    }

    /// Cumulative string-pool rows deleted since process start.
    pub fn string_pool_deleted_total(&self) -> u64 {
        self.string_pool_deleted.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), DbError> {
        if self.is_closed() {
            return Err(DbError::Closed);
        }
        Ok(())
    }

    async fn execute_on(
        &self,
        pool: &SqlitePool,
        cache: &StatementCache,
        sql: &str,
        args: Option<SqliteArguments<'_>>,
    ) -> Result<SqliteQueryResult, DbError> {
        let stmt = self.prepared(pool, cache, sql).await?;
        let result = match &args {
            Some(a) => stmt.query_with(a.clone()).execute(pool).await,
            None => stmt.query().execute(pool).await,
        };
        match result {
            Err(err) if is_stale_statement(&err) => {
                // DDL ran since this statement was prepared; re-prepare once.
                cache.remove(sql);
                let stmt = self.prepared(pool, cache, sql).await?;
                match args {
                    Some(a) => stmt.query_with(a).execute(pool).await.map_err(Into::into),
                    None => stmt.query().execute(pool).await.map_err(Into::into),
                }
            }
            other => other.map_err(Into::into),
        }
    }

    async fn fetch_all_on(
        &self,
        pool: &SqlitePool,
        cache: &StatementCache,
        sql: &str,
        args: Option<SqliteArguments<'_>>,
    ) -> Result<Vec<SqliteRow>, DbError> {
        let stmt = self.prepared(pool, cache, sql).await?;
        let result = match &args {
            Some(a) => stmt.query_with(a.clone()).fetch_all(pool).await,
            None => stmt.query().fetch_all(pool).await,
        };
        match result {
            Err(err) if is_stale_statement(&err) => {
                cache.remove(sql);
                let stmt = self.prepared(pool, cache, sql).await?;
                match args {
                    Some(a) => stmt
                        .query_with(a)
                        .fetch_all(pool)
                        .await
                        .map_err(Into::into),
                    None => stmt.query().fetch_all(pool).await.map_err(Into::into),
                }
            }
            other => other.map_err(Into::into),
        }
    }

    /// Cache lookup with slow-path prepare on the matching pool.
    async fn prepared(
        &self,
        pool: &SqlitePool,
        cache: &StatementCache,
        sql: &str,
    ) -> Result<Arc<SqliteStatement<'static>>, DbError> {
        if let Some(stmt) = cache.get(sql) {
            return Ok(stmt);
        }
        let mut conn = pool.acquire().await?;
        let stmt = Statement::to_owned(&(&mut *conn).prepare(sql).await?);
        Ok(cache.insert(sql, stmt))
    }

    fn spawn_maintenance(self: &Arc<Self>) {
        let db = self.clone();
        let token = self.shutdown.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(STATEMENT_SWEEP_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tick.tick() => {
                        let evicted =
                            db.writer_stmts.evict_idle() + db.reader_stmts.evict_idle();
                        if evicted > 0 {
                            debug!(evicted, "evicted idle prepared statements");
                        }
                    }
                }
            }
        });

        let db = self.clone();
        let token = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(CLEANUP_INITIAL_DELAY) => {}
            }
            let mut consecutive_failures: u32 = 0;
            loop {
                match db.clean_string_pool().await {
                    Ok(deleted) => {
                        consecutive_failures = 0;
                        if deleted > 0 {
                            info!(deleted, "string pool cleanup complete");
                        }
                    }
                    Err(err) => {
                        consecutive_failures += 1;
                        if consecutive_failures >= CLEANUP_FAILURE_THRESHOLD {
                            error!(error = %err, failures = consecutive_failures,
                                "string pool cleanup keeps failing");
                        } else {
                            warn!(error = %err, "string pool cleanup failed; will retry");
                        }
                    }
                }
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(CLEANUP_INTERVAL) => {}
                }
            }
        });
    }

    #[cfg(test)]
    pub(crate) fn writer_statement_cache(&self) -> &StatementCache {
        &self.writer_stmts
    }

    #[cfg(test)]
    pub(crate) fn reader_statement_cache(&self) -> &StatementCache {
        &self.reader_stmts
    }

    #[cfg(test)]
    pub(crate) fn writer_pool(&self) -> &SqlitePool {
        &self.writer
    }
}

fn writer_options(path: &Path) -> SqliteConnectOptions {
    SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .page_size(4096)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5))
        .pragma("mmap_size", "268435456")
        .pragma("cache_size", "-65536")
        .pragma("analysis_limit", "400")
        .optimize_on_close(true, Some(400))
}

fn reader_options(path: &Path) -> SqliteConnectOptions {
    // Read-only connections skip the write-side pragmas (journal mode,
    // synchronous, page size).
    SqliteConnectOptions::new()
        .filename(path)
        .read_only(true)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5))
        .pragma("mmap_size", "268435456")
        .pragma("cache_size", "-65536")
        .pragma("analysis_limit", "400")
}

/// SQL keywords whose statements must run on the writer connection.
const WRITE_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "UPSERT", "REPLACE", "DELETE", "COMMIT", "ROLLBACK", "BEGIN", "CREATE",
    "ALTER", "DROP", "VACUUM",
];

/// Classify by the first keyword after leading whitespace.
pub(crate) fn is_write_query(sql: &str) -> bool {
    let keyword = sql
        .trim_start()
        .split(|c: char| c.is_whitespace() || c == '(')
        .next()
        .unwrap_or("")
        .to_ascii_uppercase();
    WRITE_KEYWORDS.contains(&keyword.as_str())
}

pub(crate) fn is_wedged_error(err: &sqlx::Error) -> bool {
    err.to_string()
        .contains("cannot start a transaction within a transaction")
}

fn is_stale_statement(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(e) if e.message().contains("schema has changed"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use sqlx::Row;

    pub(crate) async fn open_test_db() -> (tempfile::TempDir, Arc<Db>) {
        let dir = tempfile::tempdir().unwrap();
        let metrics = Metrics::new().unwrap();
        let db = Db::open(dir.path().join("gateway.db"), metrics)
            .await
            .unwrap();
        (dir, db)
    }

    #[test]
    fn classifies_first_keyword() {
        assert!(is_write_query("INSERT INTO t VALUES (1)"));
        assert!(is_write_query("  update t set a = 1"));
        assert!(is_write_query("\n\tDELETE FROM t"));
        assert!(is_write_query("create table t (a)"));
        assert!(is_write_query("VACUUM"));
        assert!(!is_write_query("SELECT 1"));
        assert!(!is_write_query("  select * from t"));
        assert!(!is_write_query("PRAGMA user_version"));
        assert!(!is_write_query("WITH x AS (SELECT 1) SELECT * FROM x"));
    }

    #[tokio::test]
    async fn open_exec_query_roundtrip() {
        let (_dir, db) = open_test_db().await;

        let res = db
            .execute(
                sqlx::query(
                    "INSERT INTO instances (name, base_url, created_at, updated_at) VALUES (?, ?, ?, ?)",
                )
                .bind("main")
                .bind("http://localhost:8080")
                .bind(helpers::now_iso8601())
                .bind(helpers::now_iso8601()),
            )
            .await
            .unwrap();
        assert_eq!(res.rows_affected(), 1);

        let row = db
            .fetch_optional(sqlx::query("SELECT name FROM instances WHERE id = ?").bind(1_i64))
            .await
            .unwrap()
            .expect("row");
        assert_eq!(row.get::<String, _>("name"), "main");

        let none = db
            .fetch_optional(sqlx::query("SELECT name FROM instances WHERE id = ?").bind(99_i64))
            .await
            .unwrap();
        assert!(none.is_none());

        db.close().await;
        assert_matches!(
            db.fetch_all(sqlx::query("SELECT 1")).await,
            Err(DbError::Closed)
        );
    }

    #[tokio::test]
    async fn caches_statements_per_pool() {
        let (_dir, db) = open_test_db().await;

        let sql = "SELECT COUNT(*) AS n FROM instances";
        db.fetch_all(sqlx::query(sql)).await.unwrap();
        assert_eq!(db.reader_statement_cache().len(), 1);
        assert_eq!(db.writer_statement_cache().len(), 0);

        // Second use within the TTL hits the same cached handle.
        let before = db.reader_statement_cache().get(sql).unwrap();
        db.fetch_all(sqlx::query(sql)).await.unwrap();
        let after = db.reader_statement_cache().get(sql).unwrap();
        assert!(Arc::ptr_eq(&before, &after));
    }

    #[tokio::test]
    async fn idle_statements_are_evicted() {
        let (_dir, db) = open_test_db().await;

        let sql = "SELECT 1";
        db.fetch_all(sqlx::query(sql)).await.unwrap();
        assert_eq!(db.reader_statement_cache().len(), 1);

        db.reader_statement_cache()
            .backdate(sql, STATEMENT_TTL + Duration::from_secs(1));
        assert_eq!(db.reader_statement_cache().evict_idle(), 1);
        assert!(db.reader_statement_cache().is_empty());
    }

    #[tokio::test]
    async fn write_transactions_are_serialised() {
        let (_dir, db) = open_test_db().await;

        let tx = db.begin(false).await.unwrap();

        // A second write transaction must wait on the mutex, not error.
        let pending = {
            let db = db.clone();
            tokio::spawn(async move {
                let tx2 = db.begin(false).await.unwrap();
                tx2.rollback().await.unwrap();
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pending.is_finished());

        tx.rollback().await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), pending)
            .await
            .expect("second begin proceeded after rollback")
            .unwrap();
    }

    #[tokio::test]
    async fn wedged_begin_is_reported_not_retried() {
        let (_dir, db) = open_test_db().await;

        // Wedge the writer connection at the driver level: open a raw
        // transaction and hand the connection back to the pool mid-flight.
        {
            let mut conn = db.writer_pool().acquire().await.unwrap();
            sqlx::raw_sql("BEGIN").execute(&mut *conn).await.unwrap();
        }

        let err = db.begin(false).await.expect_err("begin must fail");
        assert_matches!(err, DbError::Wedged(_));

        // The mutex must not be poisoned: unwedge and begin again.
        {
            let mut conn = db.writer_pool().acquire().await.unwrap();
            sqlx::raw_sql("ROLLBACK").execute(&mut *conn).await.unwrap();
        }
        let tx = db.begin(false).await.unwrap();
        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn commit_promotes_statements_rollback_does_not() {
        let (_dir, db) = open_test_db().await;

        let insert = "INSERT INTO string_pool (value) VALUES (?)";
        let mut tx = db.begin(false).await.unwrap();
        tx.execute(sqlx::query(insert).bind("movies")).await.unwrap();
        tx.commit().await.unwrap();
        assert!(db.writer_statement_cache().get(insert).is_some());

        let insert2 = "INSERT INTO string_pool (value) VALUES (?), (?)";
        let mut tx = db.begin(false).await.unwrap();
        tx.execute(sqlx::query(insert2).bind("a").bind("b"))
            .await
            .unwrap();
        tx.rollback().await.unwrap();
        assert!(db.writer_statement_cache().get(insert2).is_none());
    }
}
