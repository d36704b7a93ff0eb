//! Feed polling pipeline.
//!
//! - [`scheduler`] picks due sources and runs polls concurrently
//! - [`fetcher`] performs one conditional fetch and walks the HTTP status
//!   state machine (redirects, Cloudflare, 304s)
//! - [`ingest`] parses a body ([`parser`]), normalizes entries ([`entry`],
//!   [`html`]) and splits them into new and known posts ([`merge`])
//! - [`interval`] adapts each source's polling cadence
//! - [`agent`] and [`proxy`] handle identity and proxy rotation for
//!   Cloudflare-protected sources
//!
//! # Example
//!
//! ```no_run
//! use feedpoll::config::Config;
//! use feedpoll::feed::{Poller, Selection};
//! use feedpoll::storage::Database;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = Config::default();
//! let db = Database::open("feeds.db").await?;
//! let poller = Poller::from_config(db, &config)?;
//! let reports = poller.update_feeds(Selection::Due, config.max_feeds).await?;
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod entry;
pub mod fetcher;
pub mod html;
pub mod ingest;
pub mod interval;
pub mod merge;
pub mod parser;
pub mod proxy;
pub mod scheduler;

pub use fetcher::{FetchError, PollError, PollReport, PollSettings, PollSummary, Poller};
pub use ingest::{import_feed, ImportOutcome};
pub use parser::{FeedFormat, ParseError};
pub use proxy::{parse_proxy_list, ProxyPool, PROXY_LIST_URL};
pub use scheduler::{spawn_scheduler, SchedulerHandle, Selection};
