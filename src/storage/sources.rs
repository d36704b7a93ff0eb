use anyhow::Result;
use sqlx::{QueryBuilder, SqliteConnection};

use super::schema::Database;
use super::types::{DatabaseError, NewSource, Source, DEFAULT_INTERVAL};

pub(crate) const SOURCE_COLUMNS: &str = "id, owner, name, site_url, feed_url, image_url, description, \
     last_polled, due_poll, interval, etag, last_modified, last_result, status_code, \
     last_success, last_change, live, last_302_url, last_302_start, max_index, num_subs, \
     is_cloudflare";

impl Database {
    // ========================================================================
    // Source Operations
    // ========================================================================

    /// Subscribe to a feed. The new source is due immediately.
    pub async fn insert_source(&self, source: &NewSource) -> Result<i64> {
        let now = chrono::Utc::now().timestamp();
        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO sources (owner, name, feed_url, due_poll, interval, num_subs)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING id
        "#,
        )
        .bind(&source.owner)
        .bind(&source.name)
        .bind(&source.feed_url)
        .bind(now)
        .bind(DEFAULT_INTERVAL)
        .bind(source.num_subs)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    pub async fn get_source(&self, source_id: i64) -> Result<Option<Source>> {
        let source = sqlx::query_as::<_, Source>(&format!(
            "SELECT {SOURCE_COLUMNS} FROM sources WHERE id = ?"
        ))
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(source)
    }

    /// All sources, alphabetical by name with unnamed sources last.
    pub async fn get_sources(&self) -> Result<Vec<Source>> {
        let sources = sqlx::query_as::<_, Source>(&format!(
            "SELECT {SOURCE_COLUMNS} FROM sources ORDER BY name IS NULL, name COLLATE NOCASE, id"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(sources)
    }

    /// Live sources whose `due_poll` has passed, most overdue first.
    pub async fn due_sources(&self, now: i64, limit: i64) -> Result<Vec<Source>> {
        let sources = sqlx::query_as::<_, Source>(&format!(
            r#"
            SELECT {SOURCE_COLUMNS} FROM sources
            WHERE live = 1 AND due_poll <= ?
            ORDER BY due_poll ASC, id ASC
            LIMIT ?
        "#
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(sources)
    }

    /// Number of sources waiting for a poll (queue size for logging)
    pub async fn count_due_sources(&self, now: i64) -> Result<i64> {
        let row: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM sources WHERE live = 1 AND due_poll <= ?")
                .bind(now)
                .fetch_one(&self.pool)
                .await?;
        Ok(row.0)
    }

    /// Caller-selected sources, ordered like the due queue.
    ///
    /// Unlike [`due_sources`](Self::due_sources) this ignores `live` and
    /// `due_poll`: an explicit request polls what it names.
    pub async fn sources_by_ids(&self, ids: &[i64], limit: i64) -> Result<Vec<Source>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder: QueryBuilder<sqlx::Sqlite> =
            QueryBuilder::new(format!("SELECT {SOURCE_COLUMNS} FROM sources WHERE id IN ("));
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(") ORDER BY due_poll ASC, id ASC LIMIT ");
        builder.push_bind(limit);

        let sources: Vec<Source> = builder.build_query_as().fetch_all(&self.pool).await?;
        Ok(sources)
    }

    /// Persist every mutable field of a source.
    pub async fn save_source(&self, source: &Source) -> Result<(), DatabaseError> {
        let mut conn = self.pool.acquire().await?;
        write_source(&mut conn, source).await
    }

    /// Unsubscribe. Posts go with the source (ON DELETE CASCADE).
    ///
    /// Returns the number of posts removed.
    pub async fn delete_source(&self, source_id: i64) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        let posts: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM posts WHERE source_id = ?")
            .bind(source_id)
            .fetch_one(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM sources WHERE id = ?")
            .bind(source_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(posts.0 as u64)
    }
}

/// UPDATE every column of `source` on the given connection (pool or transaction).
pub(crate) async fn write_source(
    conn: &mut SqliteConnection,
    source: &Source,
) -> Result<(), DatabaseError> {
    let result = sqlx::query(
        r#"
        UPDATE sources SET
            owner = ?, name = ?, site_url = ?, feed_url = ?, image_url = ?, description = ?,
            last_polled = ?, due_poll = ?, interval = ?, etag = ?, last_modified = ?,
            last_result = ?, status_code = ?, last_success = ?, last_change = ?, live = ?,
            last_302_url = ?, last_302_start = ?, max_index = ?, num_subs = ?, is_cloudflare = ?
        WHERE id = ?
    "#,
    )
    .bind(&source.owner)
    .bind(&source.name)
    .bind(&source.site_url)
    .bind(&source.feed_url)
    .bind(&source.image_url)
    .bind(&source.description)
    .bind(source.last_polled)
    .bind(source.due_poll)
    .bind(source.interval)
    .bind(&source.etag)
    .bind(&source.last_modified)
    .bind(&source.last_result)
    .bind(source.status_code)
    .bind(source.last_success)
    .bind(source.last_change)
    .bind(source.live)
    .bind(&source.last_302_url)
    .bind(source.last_302_start)
    .bind(source.max_index)
    .bind(source.num_subs)
    .bind(source.is_cloudflare)
    .bind(source.id)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DatabaseError::SourceNotFound(source.id));
    }
    Ok(())
}
