//! Adaptive feed poller.
//!
//! Polls RSS, Atom and JSON feeds on a per-source schedule that speeds up
//! for busy feeds and backs off for quiet or failing ones, tracks
//! redirects, rotates proxies for Cloudflare-protected sources and stores
//! deduplicated, sequenced posts in SQLite.

pub mod config;
pub mod feed;
pub mod storage;
pub mod util;
