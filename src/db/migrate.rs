//! Embedded schema migrations.
//!
//! Files under `migrations/` are applied in filename order and tracked in
//! the `migrations` table. Pending migrations run inside one wrapping
//! transaction, except table-recreation migrations, which need foreign keys
//! disabled: those commit the wrapper, toggle the pragma outside any
//! transaction, run in their own transaction, then resume.

use sqlx::sqlite::SqlitePool;
use tracing::{error, info};

use super::{DbError, helpers};

struct Migration {
    filename: &'static str,
    sql: &'static str,
    /// Table-recreation migrations must run with foreign keys off.
    disable_foreign_keys: bool,
}

/// Keep sorted by filename; the runner re-sorts defensively but the list is
/// the source of truth for what ships.
static MIGRATIONS: &[Migration] = &[
    Migration {
        filename: "0001_instances.sql",
        sql: include_str!("../../migrations/0001_instances.sql"),
        disable_foreign_keys: false,
    },
    Migration {
        filename: "0002_string_pool.sql",
        sql: include_str!("../../migrations/0002_string_pool.sql"),
        disable_foreign_keys: false,
    },
    Migration {
        filename: "0003_downstream_keys_cascade.sql",
        sql: include_str!("../../migrations/0003_downstream_keys_cascade.sql"),
        disable_foreign_keys: true,
    },
];

fn migration_error(name: &str, source: sqlx::Error) -> DbError {
    DbError::Migration {
        name: name.to_owned(),
        source,
    }
}

/// Apply all pending migrations on the writer pool. Any failure aborts the
/// wrapping transaction and the gateway refuses to start.
pub(super) async fn run(writer: &SqlitePool) -> Result<(), DbError> {
    let mut conn = writer.acquire().await?;

    sqlx::raw_sql(
        "CREATE TABLE IF NOT EXISTS migrations (
            filename TEXT NOT NULL UNIQUE,
            applied_at TEXT NOT NULL
        )",
    )
    .execute(&mut *conn)
    .await?;

    let applied: Vec<String> = sqlx::query_scalar("SELECT filename FROM migrations")
        .fetch_all(&mut *conn)
        .await?;

    let mut pending: Vec<&Migration> = MIGRATIONS
        .iter()
        .filter(|m| !applied.iter().any(|a| a == m.filename))
        .collect();
    pending.sort_by_key(|m| m.filename);

    if pending.is_empty() {
        return Ok(());
    }

    // The wrapper transaction is driven with raw BEGIN/COMMIT so it can be
    // suspended around the foreign-keys-off window.
    sqlx::raw_sql("BEGIN IMMEDIATE")
        .execute(&mut *conn)
        .await?;
    let mut in_wrapper = true;

    for migration in pending {
        if migration.disable_foreign_keys {
            if in_wrapper {
                sqlx::raw_sql("COMMIT").execute(&mut *conn).await?;
                in_wrapper = false;
            }
            // The pragma is a no-op inside a transaction; it must run here.
            sqlx::raw_sql("PRAGMA foreign_keys = OFF")
                .execute(&mut *conn)
                .await?;

            sqlx::raw_sql("BEGIN IMMEDIATE")
                .execute(&mut *conn)
                .await?;
            if let Err(err) = apply(&mut conn, migration).await {
                let _ = sqlx::raw_sql("ROLLBACK").execute(&mut *conn).await;
                let _ = sqlx::raw_sql("PRAGMA foreign_keys = ON")
                    .execute(&mut *conn)
                    .await;
                return Err(err);
            }
            sqlx::raw_sql("COMMIT")
                .execute(&mut *conn)
                .await
                .map_err(|e| migration_error(migration.filename, e))?;

            if let Err(err) = sqlx::raw_sql("PRAGMA foreign_keys = ON")
                .execute(&mut *conn)
                .await
            {
                // Data is already committed; reverting would lose it.
                error!(
                    migration = migration.filename,
                    error = %err,
                    "failed to re-enable foreign keys; manual intervention required"
                );
            }

            sqlx::raw_sql("BEGIN IMMEDIATE")
                .execute(&mut *conn)
                .await?;
            in_wrapper = true;
        } else if let Err(err) = apply(&mut conn, migration).await {
            let _ = sqlx::raw_sql("ROLLBACK").execute(&mut *conn).await;
            return Err(err);
        }

        info!(migration = migration.filename, "migration applied");
    }

    if in_wrapper {
        sqlx::raw_sql("COMMIT").execute(&mut *conn).await?;
    }
    Ok(())
}

async fn apply(
    conn: &mut sqlx::pool::PoolConnection<sqlx::Sqlite>,
    migration: &Migration,
) -> Result<(), DbError> {
    sqlx::raw_sql(migration.sql)
        .execute(&mut **conn)
        .await
        .map_err(|e| migration_error(migration.filename, e))?;

    sqlx::query("INSERT INTO migrations (filename, applied_at) VALUES (?, ?)")
        .bind(migration.filename)
        .bind(helpers::now_iso8601())
        .execute(&mut **conn)
        .await
        .map_err(|e| migration_error(migration.filename, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_sorted_and_unique() {
        let mut names: Vec<_> = MIGRATIONS.iter().map(|m| m.filename).collect();
        let sorted = {
            let mut s = names.clone();
            s.sort();
            s
        };
        assert_eq!(names, sorted);
        names.dedup();
        assert_eq!(names.len(), MIGRATIONS.len());
    }

    #[tokio::test]
    async fn run_is_idempotent() {
        let (_dir, db) = crate::db::tests::open_test_db().await;
        // Db::open already ran migrations; a second pass must be a no-op.
        run(db.writer_pool()).await.unwrap();

        let rows: Vec<String> = sqlx::query_scalar("SELECT filename FROM migrations ORDER BY filename")
            .fetch_all(db.writer_pool())
            .await
            .unwrap();
        assert_eq!(rows.len(), MIGRATIONS.len());
    }
}
