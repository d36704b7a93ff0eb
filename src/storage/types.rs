use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Database-specific errors with user-friendly messages
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another process holds a write lock on the database
    #[error("The feed database is locked by another process. Please try again later.")]
    Locked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// A record the caller referenced does not exist
    #[error("Source {0} not found")]
    SourceNotFound(i64),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Check if a sqlx error indicates database locking
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        if is_lock_message(&err.to_string()) {
            return DatabaseError::Locked;
        }
        DatabaseError::Other(err)
    }
}

/// SQLITE_BUSY (5) and SQLITE_LOCKED (6) surface only through their messages.
pub(crate) fn is_lock_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("database is locked")
        || lower.contains("database table is locked")
        || lower.contains("sqlite_busy")
        || lower.contains("sqlite_locked")
}

// ============================================================================
// Sources
// ============================================================================

/// Polling interval a new source starts with, in minutes.
pub const DEFAULT_INTERVAL: i64 = 400;

/// A feed subscription as supplied by the presentation layer.
#[derive(Debug, Clone)]
pub struct NewSource {
    pub feed_url: String,
    pub name: Option<String>,
    pub owner: Option<String>,
    pub num_subs: i64,
}

impl NewSource {
    pub fn new(feed_url: impl Into<String>) -> Self {
        Self {
            feed_url: feed_url.into(),
            name: None,
            owner: None,
            num_subs: 1,
        }
    }
}

/// A polled feed subscription with its full polling state.
///
/// All timestamps are Unix seconds (UTC). `interval` is in minutes.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Source {
    pub id: i64,
    /// Opaque account reference; only the presentation layer interprets it
    pub owner: Option<String>,
    pub name: Option<String>,
    pub site_url: Option<String>,
    pub feed_url: String,
    pub image_url: Option<String>,
    pub description: Option<String>,

    pub last_polled: Option<i64>,
    pub due_poll: i64,
    pub interval: i64,

    /// Conditional-fetch cache, echoed back verbatim
    pub etag: Option<String>,
    pub last_modified: Option<String>,

    pub last_result: Option<String>,
    /// Last HTTP status; 0 = fetch error, 1 = proxy failure
    pub status_code: i64,
    pub last_success: Option<i64>,
    pub last_change: Option<i64>,
    pub live: bool,

    pub last_302_url: Option<String>,
    pub last_302_start: Option<i64>,

    /// Highest post index handed out so far
    pub max_index: i64,

    pub num_subs: i64,
    pub is_cloudflare: bool,
}

impl Source {
    /// The site link if the feed advertised one, else the feed URL itself.
    pub fn best_link(&self) -> &str {
        match self.site_url.as_deref() {
            Some(site) if !site.is_empty() => site,
            _ => &self.feed_url,
        }
    }

    pub fn display_name(&self) -> &str {
        match self.name.as_deref() {
            Some(name) if !name.is_empty() => name,
            _ => self.best_link(),
        }
    }
}

// ============================================================================
// Posts
// ============================================================================

/// A normalized entry ready to be stored for a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPost {
    pub guid: String,
    pub title: String,
    /// Sanitized display excerpt
    pub body: String,
    pub link: Option<String>,
    pub author: String,
    pub image_url: Option<String>,
    pub created: i64,
}

/// Stored post
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Post {
    pub id: i64,
    pub source_id: i64,
    pub guid: String,
    pub title: String,
    pub body: String,
    pub link: Option<String>,
    pub author: String,
    pub image_url: Option<String>,
    pub created: i64,
    pub found: i64,
    /// Per-source ordinal; 0 until sequenced
    #[sqlx(rename = "idx")]
    pub index: i64,
}

/// New-versus-existing split of one feed import.
///
/// Built by the merger from the source's known GUIDs; applied by
/// [`Database::commit_poll`](super::Database::commit_poll).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergePlan {
    pub inserts: Vec<ParsedPost>,
    pub updates: Vec<ParsedPost>,
}

impl MergePlan {
    /// True when the import brought at least one post we had never seen.
    pub fn changed(&self) -> bool {
        !self.inserts.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty()
    }
}

/// Counts reported back from a committed poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitStats {
    pub inserted: usize,
    pub updated: usize,
    /// Number of posts that received an index in this commit
    pub sequenced: usize,
}

// ============================================================================
// Post read model
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PostSort {
    #[default]
    Created,
    Title,
    Body,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    #[default]
    Descending,
}

/// Filters for listing posts. `None` fields do not constrain the result.
#[derive(Debug, Clone, Default)]
pub struct PostQuery {
    /// Case-insensitive substring of the source name
    pub source_name: Option<String>,
    /// Case-insensitive substring of the post title
    pub title: Option<String>,
    pub created_from: Option<i64>,
    pub created_to: Option<i64>,
    pub sort: PostSort,
    pub order: SortOrder,
    pub limit: Option<i64>,
}

// ============================================================================
// Proxies
// ============================================================================

/// Address stored in place of a real proxy when none could be found.
pub const DEAD_PROXY: &str = "X";

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Proxy {
    pub id: i64,
    pub address: String,
}

impl Proxy {
    pub fn is_dead(&self) -> bool {
        self.address == DEAD_PROXY
    }
}
