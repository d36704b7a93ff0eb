use anyhow::Result;
use sqlx::{QueryBuilder, SqliteConnection};
use std::collections::HashSet;

use super::schema::Database;
use super::sources::write_source;
use super::types::{
    CommitStats, DatabaseError, MergePlan, Post, PostQuery, PostSort, SortOrder, Source,
};

/// Hard cap on listed posts (OOM protection)
const MAX_POSTS: i64 = 2000;

const POST_COLUMNS: &str =
    "p.id, p.source_id, p.guid, p.title, p.body, p.link, p.author, p.image_url, p.created, p.found, p.idx";

impl Database {
    // ========================================================================
    // Ingestion
    // ========================================================================

    /// GUIDs already stored for a source.
    pub async fn existing_guids(&self, source_id: i64) -> Result<HashSet<String>, DatabaseError> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT guid FROM posts WHERE source_id = ?")
            .bind(source_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(guid,)| guid).collect())
    }

    /// Write the outcome of one poll in a single transaction.
    ///
    /// Applies the merge plan, runs the sequencer when the plan brought new
    /// posts, and saves the source (including its advanced `max_index`). A
    /// failure anywhere rolls everything back, leaving the previous poll's
    /// state in place.
    ///
    /// Inserts use `INSERT OR IGNORE` so a GUID that appeared between planning
    /// and commit is updated rather than duplicated.
    pub async fn commit_poll(
        &self,
        source: &mut Source,
        plan: &MergePlan,
    ) -> Result<CommitStats, DatabaseError> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        let mut stats = CommitStats::default();

        for post in &plan.inserts {
            let result = sqlx::query(
                r#"
                INSERT OR IGNORE INTO posts
                    (source_id, guid, title, body, link, author, image_url, created, found, idx)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0)
            "#,
            )
            .bind(source.id)
            .bind(&post.guid)
            .bind(&post.title)
            .bind(&post.body)
            .bind(&post.link)
            .bind(&post.author)
            .bind(&post.image_url)
            .bind(post.created)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() > 0 {
                stats.inserted += 1;
            } else {
                update_post(&mut tx, source.id, post).await?;
                stats.updated += 1;
            }
        }

        for post in &plan.updates {
            update_post(&mut tx, source.id, post).await?;
            stats.updated += 1;
        }

        if plan.changed() {
            stats.sequenced = sequence_posts(&mut tx, source).await?;
        }

        write_source(&mut tx, source).await?;
        tx.commit().await?;

        Ok(stats)
    }

    // ========================================================================
    // Post Queries
    // ========================================================================

    /// Posts of one source in index order (unsequenced posts first).
    pub async fn get_posts_for_source(&self, source_id: i64) -> Result<Vec<Post>> {
        let posts = sqlx::query_as::<_, Post>(&format!(
            "SELECT {POST_COLUMNS} FROM posts p WHERE p.source_id = ? ORDER BY p.idx ASC, p.created ASC, p.id ASC"
        ))
        .bind(source_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(posts)
    }

    /// Filtered, sorted post listing for the presentation layer.
    pub async fn list_posts(&self, query: &PostQuery) -> Result<Vec<Post>> {
        let limit = query.limit.unwrap_or(500).clamp(1, MAX_POSTS);

        let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(format!(
            "SELECT {POST_COLUMNS} FROM posts p JOIN sources s ON s.id = p.source_id WHERE 1 = 1"
        ));

        // LIKE is case-insensitive for ASCII in SQLite
        if let Some(name) = query.source_name.as_deref() {
            builder.push(" AND s.name LIKE ");
            builder.push_bind(like_pattern(name));
            builder.push(" ESCAPE '\\'");
        }
        if let Some(title) = query.title.as_deref() {
            builder.push(" AND p.title LIKE ");
            builder.push_bind(like_pattern(title));
            builder.push(" ESCAPE '\\'");
        }
        if let Some(from) = query.created_from {
            builder.push(" AND p.created >= ");
            builder.push_bind(from);
        }
        if let Some(to) = query.created_to {
            builder.push(" AND p.created <= ");
            builder.push_bind(to);
        }

        let column = match query.sort {
            PostSort::Created => "p.created",
            PostSort::Title => "p.title COLLATE NOCASE",
            PostSort::Body => "p.body COLLATE NOCASE",
        };
        let direction = match query.order {
            SortOrder::Ascending => "ASC",
            SortOrder::Descending => "DESC",
        };
        builder.push(format!(" ORDER BY {column} {direction}, p.id {direction} LIMIT "));
        builder.push_bind(limit);

        tracing::debug!(limit = limit, "list_posts with limit cap");
        let posts: Vec<Post> = builder.build_query_as().fetch_all(&self.pool).await?;
        Ok(posts)
    }
}

async fn update_post(
    conn: &mut SqliteConnection,
    source_id: i64,
    post: &super::types::ParsedPost,
) -> Result<(), DatabaseError> {
    // idx and found are left alone
    sqlx::query(
        r#"
        UPDATE posts SET
            title = ?, body = ?, link = ?, author = ?, image_url = ?, created = ?
        WHERE source_id = ? AND guid = ?
    "#,
    )
    .bind(&post.title)
    .bind(&post.body)
    .bind(&post.link)
    .bind(&post.author)
    .bind(&post.image_url)
    .bind(post.created)
    .bind(source_id)
    .bind(&post.guid)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Hand out indices to every unsequenced post of `source`, oldest first,
/// continuing from `source.max_index`. Advances `source.max_index`.
async fn sequence_posts(
    conn: &mut SqliteConnection,
    source: &mut Source,
) -> Result<usize, DatabaseError> {
    let pending: Vec<(i64,)> = sqlx::query_as(
        "SELECT id FROM posts WHERE source_id = ? AND idx = 0 ORDER BY created ASC, id ASC",
    )
    .bind(source.id)
    .fetch_all(&mut *conn)
    .await?;

    let mut next = source.max_index;
    for (post_id,) in &pending {
        next += 1;
        sqlx::query("UPDATE posts SET idx = ? WHERE id = ?")
            .bind(next)
            .bind(post_id)
            .execute(&mut *conn)
            .await?;
    }

    source.max_index = next;
    Ok(pending.len())
}

fn like_pattern(needle: &str) -> String {
    let escaped = needle
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{}%", escaped)
}
