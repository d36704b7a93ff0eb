use anyhow::Result;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use std::str::FromStr;
use std::time::Duration;

use super::types::{is_lock_message, DatabaseError};

// ============================================================================
// Database
// ============================================================================

#[derive(Clone)]
pub struct Database {
    pub(crate) pool: SqlitePool,
}

impl Database {
    /// Open a database connection and run migrations
    ///
    /// `":memory:"` opens a private in-memory store (used by tests).
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError::Locked` if another process holds the database
    /// lock (SQLITE_BUSY, SQLITE_LOCKED). Returns `DatabaseError::Other` for
    /// other database errors.
    pub async fn open(path: &str) -> Result<Self, DatabaseError> {
        let url = format!("sqlite:{}?mode=rwc", path);
        let in_memory = path == ":memory:";

        // Restrict the database file to the current user before the pool touches it
        #[cfg(unix)]
        if !in_memory {
            use std::os::unix::fs::OpenOptionsExt;
            let db_path = std::path::Path::new(path);
            if !db_path.exists() && db_path.parent().is_some_and(|p| p.exists()) {
                let _file = std::fs::OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .mode(0o600)
                    .open(db_path)
                    .ok(); // If creation fails, SQLite will report the error at connect_with.
            }
        }

        // busy_timeout=5000: concurrent poll commits wait for the writer lock
        // instead of failing with SQLITE_BUSY.
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(DatabaseError::from_sqlx)?
            .foreign_keys(true)
            .pragma("busy_timeout", "5000");

        // Shared-cache in-memory databases report table locks without honouring
        // busy_timeout, so they get a single connection.
        let max_connections = if in_memory { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        let db = Self { pool };
        db.migrate().await.map_err(|e| {
            if is_lock_message(&e.to_string()) {
                DatabaseError::Locked
            } else {
                DatabaseError::Migration(e.to_string())
            }
        })?;
        Ok(db)
    }

    /// Run database migrations atomically within a transaction.
    ///
    /// All statements use `IF NOT EXISTS`, so re-running on an existing
    /// database is a no-op.
    async fn migrate(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        // due_poll defaults to the distant past so a bare INSERT polls first
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sources (
                id INTEGER PRIMARY KEY,
                owner TEXT,
                name TEXT,
                site_url TEXT,
                feed_url TEXT NOT NULL,
                image_url TEXT,
                description TEXT,
                last_polled INTEGER,
                due_poll INTEGER NOT NULL DEFAULT -2208988800,
                interval INTEGER NOT NULL DEFAULT 400,
                etag TEXT,
                last_modified TEXT,
                last_result TEXT,
                status_code INTEGER NOT NULL DEFAULT 0,
                last_success INTEGER,
                last_change INTEGER,
                live INTEGER NOT NULL DEFAULT 1,
                last_302_url TEXT,
                last_302_start INTEGER,
                max_index INTEGER NOT NULL DEFAULT 0,
                num_subs INTEGER NOT NULL DEFAULT 1,
                is_cloudflare INTEGER NOT NULL DEFAULT 0
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS posts (
                id INTEGER PRIMARY KEY,
                source_id INTEGER NOT NULL REFERENCES sources(id) ON DELETE CASCADE,
                guid TEXT NOT NULL,
                title TEXT NOT NULL DEFAULT '',
                body TEXT NOT NULL DEFAULT '',
                link TEXT,
                author TEXT NOT NULL DEFAULT '',
                image_url TEXT,
                created INTEGER NOT NULL,
                found INTEGER NOT NULL,
                idx INTEGER NOT NULL DEFAULT 0,
                UNIQUE(source_id, guid)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS proxies (
                id INTEGER PRIMARY KEY,
                address TEXT NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // Scheduler: WHERE live = 1 AND due_poll <= ? ORDER BY due_poll
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_sources_due ON sources(live, due_poll)")
            .execute(&mut *tx)
            .await?;

        // Sequencer: WHERE source_id = ? AND idx = 0 ORDER BY created
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_posts_source_idx ON posts(source_id, idx, created)",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_posts_created ON posts(created DESC)")
            .execute(&mut *tx)
            .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_proxies_address ON proxies(address)")
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(())
    }
}
