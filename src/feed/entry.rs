//! Format-neutral feed records and the policies that turn them into posts.
//!
//! Both parsers emit [`RawEntry`] values where every field is optional.
//! [`normalize`] applies the body, GUID and date rules, so XML and JSON
//! feeds dedupe and sequence identically.

use chrono::{DateTime, Utc};

use super::html;
use crate::storage::ParsedPost;

/// One feed item as read from the document, before any cleanup.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawEntry {
    pub id: Option<String>,
    pub link: Option<String>,
    pub title: Option<String>,
    pub author: Option<String>,
    /// Image advertised outside the body (media thumbnail, JSON `image`)
    pub image_url: Option<String>,
    pub published: Option<DateTime<Utc>>,
    /// Every body-like field the format offers; the longest wins
    pub bodies: Vec<String>,
}

/// Feed-level metadata. Each field is applied independently when present.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedMeta {
    pub title: Option<String>,
    pub site_url: Option<String>,
    pub image_url: Option<String>,
    pub description: Option<String>,
}

/// A post built from a [`RawEntry`], plus whether it lacked a date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Normalized {
    pub post: ParsedPost,
    /// No publish or update date; `created` fell back to the poll time
    pub undated: bool,
}

/// First candidate that is present and not blank.
pub fn first_present<'a, I>(candidates: I) -> Option<&'a str>
where
    I: IntoIterator<Item = Option<&'a str>>,
{
    candidates
        .into_iter()
        .flatten()
        .find(|value| !value.trim().is_empty())
}

/// Longest candidate by character count. Earlier candidates win ties.
pub fn longest<'a, I>(candidates: I) -> &'a str
where
    I: IntoIterator<Item = &'a str>,
{
    let mut best = "";
    let mut best_len = 0;
    for candidate in candidates {
        let len = candidate.chars().count();
        if len > best_len {
            best = candidate;
            best_len = len;
        }
    }
    best
}

/// Stable identity of an entry: explicit id, else link, else MD5 of the body.
pub fn derive_guid(id: Option<&str>, link: Option<&str>, body: &str) -> String {
    match first_present([id, link]) {
        Some(guid) => guid.trim().to_owned(),
        None => format!("{:x}", md5::compute(body.as_bytes())),
    }
}

/// Turn a raw entry into a storable post.
///
/// `site_url` anchors relative image references in the body. `now` stands
/// in for a missing date.
pub fn normalize(
    entry: RawEntry,
    site_url: Option<&str>,
    excerpt_chars: usize,
    now: DateTime<Utc>,
) -> Normalized {
    let body = longest(entry.bodies.iter().map(String::as_str));
    let body = html::fix_relative(body, site_url);

    // Hash the body as published (after URL fixing), before any excerpting
    let guid = derive_guid(entry.id.as_deref(), entry.link.as_deref(), &body);

    let image_url = html::first_image(&body).or(entry.image_url);
    let text = html::to_text(&body);

    let title = entry
        .title
        .as_deref()
        .map(html::to_text)
        .unwrap_or_default();
    let author = entry
        .author
        .as_deref()
        .map(html::to_text)
        .unwrap_or_default();
    let link = first_present([entry.link.as_deref()]).map(|l| l.trim().to_owned());

    let (created, undated) = match entry.published {
        Some(date) => (date.timestamp(), false),
        None => (now.timestamp(), true),
    };

    Normalized {
        post: ParsedPost {
            guid,
            title,
            body: html::excerpt(&text, excerpt_chars),
            link,
            author,
            image_url,
            created,
        },
        undated,
    }
}
