use std::collections::HashSet;

use chrono::{DateTime, Utc};

use super::entry::{first_present, normalize, FeedMeta};
use super::html;
use super::interval::{adjust, Cadence};
use super::merge::plan_merge;
use super::parser::{detect_format, parse, FeedFormat};
use crate::storage::{MergePlan, Source};

/// Result of importing one feed document into a source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportOutcome {
    /// The document was recognised, parsed and non-empty
    pub ok: bool,
    pub plan: MergePlan,
}

impl ImportOutcome {
    fn failed() -> Self {
        Self::default()
    }

    /// At least one never-seen post arrived.
    pub fn changed(&self) -> bool {
        self.ok && self.plan.changed()
    }
}

/// Parse a fetched body and work out what it means for `source`.
///
/// Mutates feed metadata, `last_success` and, on failure, `last_result`.
/// Nothing is written to storage; the returned plan is applied by the
/// caller together with the source row.
///
/// A failed JSON parse already adds a backoff step here; the caller adds
/// its own for any failed import, so broken JSON feeds back off twice as
/// fast as broken XML ones.
pub fn import_feed(
    source: &mut Source,
    body: &[u8],
    content_type: &str,
    known: &HashSet<String>,
    excerpt_chars: usize,
    now: DateTime<Utc>,
) -> ImportOutcome {
    let Some(format) = detect_format(content_type, body) else {
        source.last_result = Some(format!("Unknown feed type: {content_type}"));
        return ImportOutcome::failed();
    };

    let feed = match parse(format, body) {
        Ok(feed) => feed,
        Err(e) => {
            tracing::debug!(source_id = source.id, ?format, error = ?e, "Feed import failed");
            source.last_result = Some(e.to_string());
            if format == FeedFormat::Json {
                adjust(source, Cadence::FAILURE);
            }
            return ImportOutcome::failed();
        }
    };

    source.last_success = Some(now.timestamp());

    if feed.expired {
        adjust(source, Cadence::EXPIRED);
        source.last_result = Some("This feed has expired".to_owned());
        return ImportOutcome::failed();
    }

    apply_meta(source, &feed.meta);

    // Feeds list newest first; store oldest first
    let mut undated = 0;
    let posts: Vec<_> = feed
        .entries
        .into_iter()
        .rev()
        .map(|entry| {
            let normalized = normalize(entry, source.site_url.as_deref(), excerpt_chars, now);
            if normalized.undated {
                undated += 1;
            }
            normalized.post
        })
        .collect();

    if undated > 0 {
        tracing::debug!(source_id = source.id, undated, "Entries without a date use the poll time");
    }

    let plan = plan_merge(known, posts);
    tracing::debug!(
        source_id = source.id,
        new = plan.inserts.len(),
        existing = plan.updates.len(),
        "Feed imported"
    );

    ImportOutcome { ok: true, plan }
}

fn apply_meta(source: &mut Source, meta: &FeedMeta) {
    if let Some(title) = first_present([meta.title.as_deref()]) {
        source.name = Some(html::to_text(title));
    }
    if let Some(site_url) = first_present([meta.site_url.as_deref()]) {
        source.site_url = Some(site_url.trim().to_owned());
    }
    if let Some(image_url) = first_present([meta.image_url.as_deref()]) {
        source.image_url = Some(image_url.trim().to_owned());
    }
    if let Some(description) = first_present([meta.description.as_deref()]) {
        source.description = Some(html::to_text(description));
    }
}
