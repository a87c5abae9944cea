//! Transactions with statement-cache promotion.
//!
//! Inside a transaction a cached statement is bound to the transaction's
//! connection but stays in the cache for future reuse. SQL prepared fresh
//! during the transaction is recorded and, on successful commit, promoted
//! into the pool's cache. Rollback discards the set.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use sqlx::sqlite::{Sqlite, SqlitePool, SqliteQueryResult, SqliteRow};
use sqlx::{Execute, Executor, Statement, Transaction};
use tokio::sync::OwnedMutexGuard;
use tracing::warn;

use super::{DbError, StatementCache};

/// Budget for the post-commit promotion batch.
const PROMOTION_TIMEOUT: Duration = Duration::from_secs(5);

/// A live transaction. Write transactions own the writer mutex guard for
/// their entire lifetime; dropping the guard (on commit, rollback, or drop)
/// is the single release point.
pub struct Tx {
    inner: Transaction<'static, Sqlite>,
    guard: Option<OwnedMutexGuard<()>>,
    pool: SqlitePool,
    cache: Arc<StatementCache>,
    seen: HashSet<String>,
}

impl Tx {
    pub(super) fn new(
        inner: Transaction<'static, Sqlite>,
        guard: Option<OwnedMutexGuard<()>>,
        pool: SqlitePool,
        cache: Arc<StatementCache>,
    ) -> Self {
        Self {
            inner,
            guard,
            pool,
            cache,
            seen: HashSet::new(),
        }
    }

    /// Execute a statement on this transaction's connection.
    pub async fn execute<'q, E>(&mut self, query: E) -> Result<SqliteQueryResult, DbError>
    where
        E: Execute<'q, Sqlite>,
    {
        let mut query = query;
        let sql = query.sql().to_owned();
        let args = query.take_arguments().map_err(DbError::Arguments)?;

        if let Some(stmt) = self.cache.get(&sql) {
            let res = match args {
                Some(a) => stmt.query_with(a).execute(&mut *self.inner).await,
                None => stmt.query().execute(&mut *self.inner).await,
            };
            return res.map_err(Into::into);
        }

        self.seen.insert(sql.clone());
        let res = match args {
            Some(a) => {
                sqlx::query_with(sql.as_str(), a)
                    .execute(&mut *self.inner)
                    .await
            }
            None => sqlx::query(sql.as_str()).execute(&mut *self.inner).await,
        };
        res.map_err(Into::into)
    }

    /// Fetch every row of a query on this transaction's connection.
    pub async fn fetch_all<'q, E>(&mut self, query: E) -> Result<Vec<SqliteRow>, DbError>
    where
        E: Execute<'q, Sqlite>,
    {
        let mut query = query;
        let sql = query.sql().to_owned();
        let args = query.take_arguments().map_err(DbError::Arguments)?;

        if let Some(stmt) = self.cache.get(&sql) {
            let res = match args {
                Some(a) => stmt.query_with(a).fetch_all(&mut *self.inner).await,
                None => stmt.query().fetch_all(&mut *self.inner).await,
            };
            return res.map_err(Into::into);
        }

        self.seen.insert(sql.clone());
        let res = match args {
            Some(a) => {
                sqlx::query_with(sql.as_str(), a)
                    .fetch_all(&mut *self.inner)
                    .await
            }
            None => sqlx::query(sql.as_str()).fetch_all(&mut *self.inner).await,
        };
        res.map_err(Into::into)
    }

    /// Fetch at most one row.
    pub async fn fetch_optional<'q, E>(&mut self, query: E) -> Result<Option<SqliteRow>, DbError>
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

    /// Commit, then promote statements first prepared during this
    /// transaction into the pool cache. Promotion is best-effort.
    pub async fn commit(self) -> Result<(), DbError> {
        let Tx {
            inner,
            guard,
            pool,
            cache,
            seen,
        } = self;

        inner.commit().await?;

        if !seen.is_empty() {
            let promote = async {
                for sql in &seen {
                    if cache.get(sql).is_some() {
                        continue;
                    }
                    match pool.acquire().await {
                        Ok(mut conn) => match (&mut *conn).prepare(sql.as_str()).await {
                            Ok(stmt) => {
                                cache.insert(sql, Statement::to_owned(&stmt));
                            }
                            Err(err) => {
                                warn!(error = %err, "statement promotion failed");
                            }
                        },
                        Err(err) => {
                            warn!(error = %err, "statement promotion could not acquire connection");
                            break;
                        }
                    }
                }
            };
            if tokio::time::timeout(PROMOTION_TIMEOUT, promote).await.is_err() {
                warn!("statement promotion timed out");
            }
        }

        drop(guard);
        Ok(())
    }

    /// Roll back. The recorded SQL set is discarded without promotion and
    /// the writer mutex (if held) is released.
    pub async fn rollback(self) -> Result<(), DbError> {
        let Tx { inner, guard, .. } = self;
        let res = inner.rollback().await;
        drop(guard);
        res.map_err(Into::into)
    }
}
