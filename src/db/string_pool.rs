//! String-pool interning and deferred referential cleanup.
//!
//! High-cardinality text columns (category names, save paths, tags) point
//! into `string_pool` with `ON DELETE RESTRICT`. Unreferenced rows are
//! swept periodically: referenced ids are collected into a temp table, then
//! everything else is deleted with foreign-key checks deferred to commit.

use std::sync::atomic::Ordering;

use futures::future::BoxFuture;
use sqlx::Row;
use tracing::debug;

use super::{Db, DbError};

/// Every (table, column) pair that references `string_pool`. The cleanup
/// union must cover all of them; a missed pair would delete live rows.
const REFERENCING_COLUMNS: &[(&str, &str)] = &[
    ("instance_categories", "name_id"),
    ("instance_categories", "save_path_id"),
    ("instance_tags", "tag_id"),
];

async fn exec_raw(conn: &mut sqlx::SqliteConnection, sql: &str) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(sql).execute(conn).await?;
    Ok(())
}

async fn exec_delete_unreferenced(conn: &mut sqlx::SqliteConnection) -> Result<u64, sqlx::Error> {
    let res = sqlx::query(
        "DELETE FROM string_pool
         WHERE id NOT IN (SELECT id FROM string_pool_referenced)",
    )
    .execute(conn)
    .await?;
    Ok(res.rows_affected())
}

impl Db {
    /// Intern a string, returning its pool id. Existing values are reused.
    pub async fn intern_string(&self, value: &str) -> Result<i64, DbError> {
        // Upsert-with-returning so the id comes back for both paths.
        let row = self
            .fetch_optional(
                sqlx::query(
                    "INSERT INTO string_pool (value) VALUES (?)
                     ON CONFLICT (value) DO UPDATE SET value = excluded.value
                     RETURNING id",
                )
                .bind(value),
            )
            .await?
            .ok_or_else(|| DbError::Sqlx(sqlx::Error::RowNotFound))?;
        Ok(row.get::<i64, _>("id"))
    }

    /// Delete every unreferenced string-pool row. Returns the number of
    /// rows deleted. A concurrent call returns `Ok(0)` immediately.
    pub fn clean_string_pool<'a>(&'a self) -> BoxFuture<'a, Result<u64, DbError>> {
        Box::pin(async move {
            if self
                .cleanup_running
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return Ok(0);
            }
            let result = self.clean_string_pool_locked().await;
            self.cleanup_running.store(false, Ordering::Release);
            result
        })
    }

    fn clean_string_pool_locked<'a>(&'a self) -> BoxFuture<'a, Result<u64, DbError>> {
        Box::pin(async move {
        self.ensure_open()?;
        // Temp tables are per-connection: the whole sweep stays on the one
        // writer connection, under the writer mutex.
        let _guard = self.write_lock.lock().await;
        let mut conn = self.writer.acquire().await?;

        exec_raw(
            &mut *conn,
            "CREATE TEMPORARY TABLE IF NOT EXISTS string_pool_referenced (id INTEGER PRIMARY KEY)",
        )
        .await?;
        exec_raw(&mut *conn, "DELETE FROM string_pool_referenced").await?;

        let union = REFERENCING_COLUMNS
            .iter()
            .map(|(table, column)| format!("SELECT {column} AS id FROM {table} WHERE {column} IS NOT NULL"))
            .collect::<Vec<_>>()
            .join(" UNION ALL ");
        let collect = format!("INSERT OR IGNORE INTO string_pool_referenced (id) {union}");
        exec_raw(&mut *conn, &collect).await?;

        exec_raw(&mut *conn, "BEGIN").await?;
        exec_raw(&mut *conn, "PRAGMA defer_foreign_keys = ON").await?;

        let deleted = match sqlx::query(
            "DELETE FROM string_pool
             WHERE id NOT IN (SELECT id FROM string_pool_referenced)",
        )
        .execute(&mut *conn)
        .await
        {
            Ok(res) => res.rows_affected(),
            Err(err) => {
                let _ = exec_raw(&mut *conn, "ROLLBACK").await;
                return Err(err.into());
            }
        };

        if let Err(err) = exec_raw(&mut *conn, "COMMIT").await {
            let _ = exec_raw(&mut *conn, "ROLLBACK").await;
            return Err(err.into());
        }

        self.string_pool_deleted.fetch_add(deleted, Ordering::Relaxed);
        self.metrics.string_pool_deleted.inc_by(deleted);
        debug!(deleted, "string pool sweep finished");
        Ok(deleted)
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::db::helpers::now_iso8601;
    use crate::db::tests::open_test_db;

    #[tokio::test]
    async fn intern_reuses_existing_values() {
        let (_dir, db) = open_test_db().await;
        let a = db.intern_string("radarr").await.unwrap();
        let b = db.intern_string("radarr").await.unwrap();
        let c = db.intern_string("sonarr").await.unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn cleanup_deletes_only_unreferenced_rows() {
        let (_dir, db) = open_test_db().await;

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

        let kept = db.intern_string("movies").await.unwrap();
        let orphan_a = db.intern_string("stale-category").await.unwrap();
        let orphan_b = db.intern_string("stale-tag").await.unwrap();
        db.execute(
            sqlx::query(
                "INSERT INTO instance_categories (instance_id, name_id) VALUES (?, ?)",
            )
            .bind(1_i64)
            .bind(kept),
        )
        .await
        .unwrap();

        let deleted = db.clean_string_pool().await.unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(db.string_pool_deleted_total(), 2);

        let remaining: Vec<i64> = db
            .fetch_all(sqlx::query("SELECT id FROM string_pool"))
            .await
            .unwrap()
            .iter()
            .map(|r| sqlx::Row::get::<i64, _>(r, "id"))
            .collect();
        assert_eq!(remaining, vec![kept]);
        assert!(!remaining.contains(&orphan_a));
        assert!(!remaining.contains(&orphan_b));
    }

    #[tokio::test]
    async fn cleanup_is_a_noop_when_nothing_is_orphaned() {
        let (_dir, db) = open_test_db().await;
        assert_eq!(db.clean_string_pool().await.unwrap(), 0);
    }
}
