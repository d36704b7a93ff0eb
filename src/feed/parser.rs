//! XML (RSS/Atom) and JSON Feed parsing into [`RawEntry`] records.

use chrono::{DateTime, Utc};
use feed_rs::parser;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use super::entry::{first_present, FeedMeta, RawEntry};

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Feed Parse Error")]
    Malformed(String),
    #[error("Feed is empty")]
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedFormat {
    Xml,
    Json,
}

/// A parsed document. Entries are in document order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedFeed {
    pub meta: FeedMeta,
    pub entries: Vec<RawEntry>,
    /// JSON Feed `expired` flag
    pub expired: bool,
}

/// Pick a parser from the declared content type, falling back to the first
/// significant byte of the body.
pub fn detect_format(content_type: &str, body: &[u8]) -> Option<FeedFormat> {
    let content_type = content_type.to_ascii_lowercase();
    let first = first_significant_byte(body);

    if content_type.contains("xml") || first == Some(b'<') {
        Some(FeedFormat::Xml)
    } else if content_type.contains("json") || first == Some(b'{') {
        Some(FeedFormat::Json)
    } else {
        None
    }
}

fn first_significant_byte(body: &[u8]) -> Option<u8> {
    let body = body.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(body);
    body.iter().copied().find(|b| !b.is_ascii_whitespace())
}

pub fn parse(format: FeedFormat, body: &[u8]) -> Result<ParsedFeed, ParseError> {
    match format {
        FeedFormat::Xml => parse_xml(body),
        FeedFormat::Json => parse_json(body),
    }
}

// ============================================================================
// RSS / Atom
// ============================================================================

pub fn parse_xml(body: &[u8]) -> Result<ParsedFeed, ParseError> {
    // An empty id lets entry normalization apply its own fallbacks instead
    // of the parser's generated ones
    let feed = parser::Builder::new()
        .id_generator(|_links, _title, _uri| String::new())
        .build()
        .parse(body)
        .map_err(|e| ParseError::Malformed(e.to_string()))?;

    if feed.entries.is_empty() {
        return Err(ParseError::Empty);
    }

    let site_url = feed
        .links
        .iter()
        .find(|link| link.rel.as_deref() != Some("self"))
        .map(|link| link.href.clone());

    let meta = FeedMeta {
        title: feed.title.map(|t| t.content),
        site_url,
        image_url: feed.logo.or(feed.icon).map(|image| image.uri),
        description: feed.description.map(|t| t.content),
    };

    let entries = feed
        .entries
        .into_iter()
        .map(|entry| {
            let link = entry
                .links
                .iter()
                .find(|link| link.rel.as_deref().map_or(true, |rel| rel == "alternate"))
                .or(entry.links.first())
                .map(|link| link.href.clone());

            let image_url = entry
                .media
                .iter()
                .flat_map(|media| media.thumbnails.iter())
                .map(|thumb| thumb.image.uri.clone())
                .next();

            let mut bodies = Vec::new();
            if let Some(body) = entry.content.and_then(|c| c.body) {
                bodies.push(body);
            }
            if let Some(summary) = entry.summary {
                bodies.push(summary.content);
            }

            RawEntry {
                id: Some(entry.id).filter(|id| !id.is_empty()),
                link,
                title: entry.title.map(|t| t.content),
                author: entry.authors.into_iter().next().map(|person| person.name),
                image_url,
                published: entry.published.or(entry.updated),
                bodies,
            }
        })
        .collect();

    Ok(ParsedFeed {
        meta,
        entries,
        expired: false,
    })
}

// ============================================================================
// JSON Feed
// ============================================================================

/// Top-level JSON Feed object. Metadata stays untyped so a mistyped field
/// is ignored instead of failing the whole document.
#[derive(Debug, Deserialize)]
struct JsonFeed {
    #[serde(default)]
    title: Option<Value>,
    #[serde(default)]
    home_page_url: Option<Value>,
    #[serde(default)]
    description: Option<Value>,
    #[serde(default)]
    icon: Option<Value>,
    #[serde(default)]
    expired: Option<Value>,
    items: Vec<Value>,
}

pub fn parse_json(body: &[u8]) -> Result<ParsedFeed, ParseError> {
    let feed: JsonFeed =
        serde_json::from_slice(body).map_err(|e| ParseError::Malformed(e.to_string()))?;

    let expired = matches!(feed.expired, Some(Value::Bool(true)));

    let entries: Vec<RawEntry> = feed.items.iter().filter_map(json_entry).collect();
    if entries.is_empty() {
        return Err(ParseError::Empty);
    }

    Ok(ParsedFeed {
        meta: FeedMeta {
            title: string_value(feed.title.as_ref()),
            site_url: string_value(feed.home_page_url.as_ref()),
            image_url: string_value(feed.icon.as_ref()),
            description: string_value(feed.description.as_ref()),
        },
        entries,
        expired,
    })
}

/// One item. Only a non-object item is skipped; each field that is missing
/// or of the wrong type just reads as absent.
fn json_entry(item: &Value) -> Option<RawEntry> {
    if !item.is_object() {
        tracing::debug!(item = %item, "Skipping JSON feed item that is not an object");
        return None;
    }
    let field = |key: &str| string_value(item.get(key));

    let author = item
        .get("author")
        .or_else(|| item.get("authors").and_then(Value::as_array).and_then(|a| a.first()))
        .and_then(author_name);

    let published = first_present([
        field("date_published").as_deref(),
        field("date_modified").as_deref(),
    ])
    .and_then(parse_rfc3339);

    let bodies = ["content_html", "content_text", "summary"]
        .into_iter()
        .filter_map(field)
        .collect();

    Some(RawEntry {
        id: item.get("id").and_then(scalar_string),
        link: field("url"),
        title: field("title"),
        author,
        image_url: field("image").or_else(|| field("banner_image")),
        published,
        bodies,
    })
}

fn string_value(value: Option<&Value>) -> Option<String> {
    value.and_then(Value::as_str).map(str::to_owned)
}

/// Ids are strings by the JSON Feed format, but numbers show up in the wild.
fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// JSON Feed 1.0 `author` objects, 1.1 `authors` arrays, or bare strings.
fn author_name(value: &Value) -> Option<String> {
    match value {
        Value::String(name) => Some(name.clone()),
        Value::Object(fields) => fields.get("name")?.as_str().map(str::to_owned),
        _ => None,
    }
}

fn parse_rfc3339(value: &str) -> Option<DateTime<Utc>> {
    match DateTime::parse_from_rfc3339(value.trim()) {
        Ok(date) => Some(date.with_timezone(&Utc)),
        Err(e) => {
            tracing::debug!(value, error = %e, "Unparseable JSON feed date");
            None
        }
    }
}
