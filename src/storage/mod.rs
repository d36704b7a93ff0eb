//! SQLite record store for sources, posts and the proxy pool.
//!
//! Every operation is an inherent method on [`Database`], grouped by table:
//! `sources.rs`, `posts.rs` and `proxies.rs`. Schema creation lives in
//! `schema.rs`, shared row and error types in `types.rs`.

mod posts;
mod proxies;
mod schema;
mod sources;
mod types;

pub use schema::Database;
pub use types::{
    CommitStats, DatabaseError, MergePlan, NewSource, ParsedPost, Post, PostQuery, PostSort,
    Proxy, SortOrder, Source, DEAD_PROXY, DEFAULT_INTERVAL,
};
