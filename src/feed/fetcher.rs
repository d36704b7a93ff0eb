//! One poll of one source: conditional fetch, status handling, ingestion.
//!
//! A poll never fails on HTTP trouble. Every outcome is recorded on the
//! source (`status_code`, `last_result`, `interval`, ...) and committed
//! together with any new posts in a single transaction. Only storage
//! errors surface to the caller.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::redirect;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::agent::user_agent;
use super::ingest::import_feed;
use super::interval::{adjust, schedule, Cadence};
use super::proxy::ProxyPool;
use crate::config::Config;
use crate::storage::{CommitStats, Database, DatabaseError, MergePlan, Proxy, Source};
use crate::util::{resolve_location, truncate_chars};

/// A temporary redirect to the same target for longer than this is adopted
pub const PROMOTE_AFTER_DAYS: i64 = 60;

/// 304s for longer than this drop the conditional-fetch cache
pub const STALE_CACHE_DAYS: i64 = 7;

const MAX_RESULT_CHARS: usize = 255;

/// Transport-level failures. HTTP statuses are not errors here.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("{0}")]
    Network(#[from] reqwest::Error),
    #[error("Request timed out")]
    Timeout,
    #[error("Feed too large (over {0} bytes)")]
    ResponseTooLarge(usize),
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
}

#[derive(Debug, Error)]
pub enum PollError {
    #[error("source {0} is already being polled")]
    InFlight(i64),
    #[error(transparent)]
    Store(#[from] DatabaseError),
}

/// Knobs for the HTTP side of polling.
#[derive(Debug, Clone)]
pub struct PollSettings {
    /// Product token at the start of the crawler User-Agent
    pub user_agent: String,
    /// Host name advertised in the crawler User-Agent
    pub server: String,
    pub fetch_timeout: Duration,
    pub max_feed_bytes: usize,
    pub excerpt_chars: usize,
    /// Polls running at once within a batch
    pub concurrency: usize,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for PollSettings {
    fn from(config: &Config) -> Self {
        Self {
            user_agent: config.user_agent.clone(),
            server: config.server.clone(),
            fetch_timeout: Duration::from_secs(config.fetch_timeout_secs),
            max_feed_bytes: config.max_feed_bytes,
            excerpt_chars: config.excerpt_chars,
            concurrency: config.concurrency.max(1),
        }
    }
}

/// What a finished poll left on the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollSummary {
    pub status_code: i64,
    pub last_result: Option<String>,
    pub interval: i64,
    pub live: bool,
    pub stats: CommitStats,
}

/// Outcome of one poll, keyed by source for correlation.
#[derive(Debug)]
pub struct PollReport {
    pub source_id: i64,
    pub result: Result<PollSummary, PollError>,
}

/// Polls sources. Cheap to clone; clones share clients, pool and the
/// in-flight set.
#[derive(Clone)]
pub struct Poller {
    db: Database,
    /// Primary requests: redirects are handled by hand
    client: reqwest::Client,
    /// Follow-up after a temporary redirect
    follow_client: reqwest::Client,
    proxies: ProxyPool,
    pub(super) settings: Arc<PollSettings>,
    in_flight: Arc<Mutex<HashSet<i64>>>,
}

impl Poller {
    pub fn new(db: Database, settings: PollSettings, proxies: ProxyPool) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .redirect(redirect::Policy::none())
            .timeout(settings.fetch_timeout)
            .build()?;
        let follow_client = reqwest::Client::builder()
            .timeout(settings.fetch_timeout)
            .build()?;

        Ok(Self {
            db,
            client,
            follow_client,
            proxies,
            settings: Arc::new(settings),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    pub fn from_config(db: Database, config: &Config) -> Result<Self, FetchError> {
        let list_client = reqwest::Client::builder().build()?;
        let proxies = ProxyPool::new(
            db.clone(),
            list_client,
            config.proxy_list_url.clone(),
            config.dead_proxy_count,
        );
        Self::new(db, PollSettings::from(config), proxies)
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn proxies(&self) -> &ProxyPool {
        &self.proxies
    }

    /// Poll one source now, regardless of `due_poll` or `live`.
    ///
    /// Refuses with [`PollError::InFlight`] if another task is already
    /// polling the same source.
    pub async fn poll_source(&self, source: Source) -> PollReport {
        let source_id = source.id;
        let Some(_claim) = InFlight::claim(&self.in_flight, source_id) else {
            debug!(source_id, "Source already being polled, skipping");
            return PollReport {
                source_id,
                result: Err(PollError::InFlight(source_id)),
            };
        };

        let result = self.poll(source).await.map_err(PollError::from);
        if let Err(e) = &result {
            warn!(source_id, error = %e, "Poll could not be saved");
        }
        PollReport { source_id, result }
    }

    async fn poll(&self, mut source: Source) -> Result<PollSummary, DatabaseError> {
        let now = Utc::now();
        let old_interval = source.interval;
        source.last_polled = Some(now.timestamp());

        let agent = user_agent(&source, &self.settings.user_agent, &self.settings.server);
        let proxy = self.pick_proxy(&source).await;

        debug!(source_id = source.id, url = %source.feed_url, proxy = ?proxy.as_ref().map(|p| &p.address), "Fetching");

        let headers = request_headers(&agent, source.etag.as_deref(), source.last_modified.as_deref());
        let plan = match self.fetch(&source.feed_url, headers, proxy.as_ref()).await {
            Ok(response) => {
                source.last_result = Some("Unhandled Case".to_owned());
                self.handle_response(&mut source, response, &agent, proxy.as_ref(), now)
                    .await?
            }
            Err(e) => {
                self.record_fetch_error(&mut source, &e, proxy.as_ref()).await;
                MergePlan::default()
            }
        };

        schedule(&mut source, now.timestamp());
        if source.interval != old_interval {
            debug!(source_id = source.id, from = old_interval, to = source.interval, "Polling interval changed");
        }

        let stats = self.db.commit_poll(&mut source, &plan).await?;

        info!(
            source_id = source.id,
            status = source.status_code,
            result = source.last_result.as_deref().unwrap_or(""),
            new = stats.inserted,
            interval = source.interval,
            "Polled source"
        );

        Ok(PollSummary {
            status_code: source.status_code,
            last_result: source.last_result,
            interval: source.interval,
            live: source.live,
            stats,
        })
    }

    /// A real proxy for Cloudflare-flagged sources. Sentinels and pool
    /// errors mean a direct fetch.
    async fn pick_proxy(&self, source: &Source) -> Option<Proxy> {
        if !source.is_cloudflare {
            return None;
        }
        match self.proxies.get_proxy().await {
            Ok(proxy) if !proxy.is_dead() => Some(proxy),
            Ok(_) => None,
            Err(e) => {
                warn!(source_id = source.id, error = %e, "Proxy pool unavailable, fetching directly");
                None
            }
        }
    }

    fn client_for(&self, proxy: Option<&Proxy>) -> Result<reqwest::Client, FetchError> {
        let Some(proxy) = proxy else {
            return Ok(self.client.clone());
        };
        let client = reqwest::Client::builder()
            .redirect(redirect::Policy::none())
            .timeout(self.settings.fetch_timeout)
            .proxy(reqwest::Proxy::all(format!("http://{}", proxy.address))?)
            .build()?;
        Ok(client)
    }

    async fn fetch(
        &self,
        url: &str,
        headers: HeaderMap,
        proxy: Option<&Proxy>,
    ) -> Result<reqwest::Response, FetchError> {
        let client = self.client_for(proxy)?;
        send(&client, url, headers, self.settings.fetch_timeout).await
    }

    async fn record_fetch_error(&self, source: &mut Source, error: &FetchError, proxy: Option<&Proxy>) {
        warn!(source_id = source.id, url = %source.feed_url, error = %error, "Fetch failed");

        let Some(proxy) = proxy else {
            source.status_code = 0;
            set_result(source, format!("Fetch error: {error}"));
            adjust(source, Cadence::FAILURE);
            return;
        };

        // Status 1 marks "try again soon with another proxy"
        source.status_code = 1;
        set_result(
            source,
            format!("Fetch error: {error}. Proxy failed, next retry will use a new proxy"),
        );
        self.burn(proxy).await;
        adjust(source, Cadence::SOON);
    }

    async fn burn(&self, proxy: &Proxy) {
        if let Err(e) = self.proxies.burn(proxy).await {
            warn!(proxy = %proxy.address, error = %e, "Failed to burn proxy");
        }
    }

    async fn handle_response(
        &self,
        source: &mut Source,
        response: reqwest::Response,
        agent: &str,
        proxy: Option<&Proxy>,
        now: DateTime<Utc>,
    ) -> Result<MergePlan, DatabaseError> {
        let status = response.status().as_u16();
        source.status_code = i64::from(status);

        match status {
            s if !(200..500).contains(&s) => {
                adjust(source, Cadence::FAILURE);
                set_result(source, format!("Server error fetching feed ({s})"));
            }
            404 => {
                adjust(source, Cadence::FAILURE);
                set_result(source, "The feed could not be found");
            }
            403 | 410 => self.handle_forbidden(source, response, proxy).await,
            400..=499 => {
                source.live = false;
                set_result(source, format!("Bad request ({status})"));
            }
            304 => not_modified(source, now),
            301 | 308 => permanent_redirect(source, &response),
            302 | 303 | 307 => {
                if let Some(followed) = self.follow_temporary(source, &response, agent, now).await {
                    if followed.status().is_success() {
                        return self.ingest(source, followed, true, now).await;
                    }
                }
            }
            200..=299 => return self.ingest(source, response, false, now).await,
            _ => debug!(source_id = source.id, status, "Unhandled status"),
        }

        Ok(MergePlan::default())
    }

    async fn handle_forbidden(
        &self,
        source: &mut Source,
        response: reqwest::Response,
        proxy: Option<&Proxy>,
    ) {
        let server_says_cloudflare = response
            .headers()
            .get(header::SERVER)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|server| server.to_ascii_lowercase().contains("cloudflare"));

        let blocked = server_says_cloudflare || {
            match read_limited_bytes(response, self.settings.max_feed_bytes).await {
                Ok(body) => String::from_utf8_lossy(&body).contains("Cloudflare"),
                Err(_) => false,
            }
        };

        if !blocked {
            source.live = false;
            set_result(source, "Feed is no longer accessible.");
            return;
        }

        match proxy {
            Some(proxy) if source.is_cloudflare => {
                self.burn(proxy).await;
                adjust(source, Cadence::SOON);
                set_result(source, "Proxy kind of worked but still got cloudflared");
            }
            _ => {
                source.is_cloudflare = true;
                set_result(source, "Blocked by Cloudflare");
            }
        }
    }

    /// Fetch the target of a 302/303/307 directly (no proxy, no conditional
    /// headers) and track how long the source has been redirecting there.
    async fn follow_temporary(
        &self,
        source: &mut Source,
        response: &reqwest::Response,
        agent: &str,
        now: DateTime<Utc>,
    ) -> Option<reqwest::Response> {
        let target = location(response).and_then(|l| resolve_location(&source.feed_url, &l));
        let Some(target) = target else {
            adjust(source, Cadence::REDIRECT_FAILED);
            set_result(source, "Failed redirection: no usable location");
            return None;
        };

        let headers = request_headers(agent, None, None);
        match send(&self.follow_client, &target, headers, self.settings.fetch_timeout).await {
            Ok(followed) => {
                source.status_code = i64::from(followed.status().as_u16());
                track_temporary_redirect(source, &target, now);
                Some(followed)
            }
            Err(e) => {
                adjust(source, Cadence::REDIRECT_FAILED);
                set_result(source, format!("Failed redirection to {target}: {e}"));
                None
            }
        }
    }

    async fn ingest(
        &self,
        source: &mut Source,
        response: reqwest::Response,
        via_redirect: bool,
        now: DateTime<Utc>,
    ) -> Result<MergePlan, DatabaseError> {
        if via_redirect {
            // Validators belong to the old URL
            source.etag = None;
            source.last_modified = None;
        } else {
            source.etag = header_string(&response, header::ETAG);
            source.last_modified = header_string(&response, header::LAST_MODIFIED);
        }

        let content_type =
            header_string(&response, header::CONTENT_TYPE).unwrap_or_else(|| "Not Set".to_owned());

        let body = match read_limited_bytes(response, self.settings.max_feed_bytes).await {
            Ok(body) => body,
            Err(e) => {
                warn!(source_id = source.id, error = %e, "Failed to read feed body");
                let message = match e {
                    FetchError::ResponseTooLarge(_) => e.to_string(),
                    _ => format!("Fetch error: {e}"),
                };
                set_result(source, message);
                adjust(source, Cadence::FAILURE);
                return Ok(MergePlan::default());
            }
        };

        let known = self.db.existing_guids(source.id).await?;
        let outcome = import_feed(
            source,
            &body,
            &content_type,
            &known,
            self.settings.excerpt_chars,
            now,
        );

        if outcome.changed() {
            adjust(source, Cadence::SOON);
            source.last_change = Some(now.timestamp());
            set_result(source, "OK (updated)");
        } else if outcome.ok {
            adjust(source, Cadence::UNCHANGED);
            set_result(source, "OK");
        } else {
            adjust(source, Cadence::FAILURE);
        }

        Ok(outcome.plan)
    }
}

// ============================================================================
// Status handlers without I/O
// ============================================================================

fn not_modified(source: &mut Source, now: DateTime<Utc>) {
    adjust(source, Cadence::NOT_MODIFIED);

    let stale = source
        .last_success
        .and_then(|last| DateTime::from_timestamp(last, 0))
        .is_some_and(|last| (now - last).num_days() > STALE_CACHE_DAYS);
    source.last_success = Some(now.timestamp());

    if stale {
        source.etag = None;
        source.last_modified = None;
        set_result(source, "Clearing etag/last modified due to lack of changes");
    } else {
        set_result(source, "Not modified");
    }
}

fn permanent_redirect(source: &mut Source, response: &reqwest::Response) {
    let Some(location) = location(response) else {
        set_result(source, "Feed has moved but no location provided");
        return;
    };

    match resolve_location(&source.feed_url, &location) {
        Some(target) => {
            info!(source_id = source.id, from = %source.feed_url, to = %target, "Feed moved");
            source.feed_url = target;
            set_result(source, "Moved");
        }
        None => set_result(source, format!("Error redirecting feed to {location}")),
    }
}

/// Record a temporary redirect to `target`, adopting it as the feed URL
/// once the source has pointed there for over [`PROMOTE_AFTER_DAYS`].
pub fn track_temporary_redirect(source: &mut Source, target: &str, now: DateTime<Utc>) {
    let since = match (source.last_302_url.as_deref(), source.last_302_start) {
        (Some(previous), Some(start)) if previous == target => {
            DateTime::from_timestamp(start, 0).unwrap_or(now)
        }
        _ => {
            source.last_302_url = Some(target.to_owned());
            source.last_302_start = Some(now.timestamp());
            now
        }
    };

    if (now - since).num_days() > PROMOTE_AFTER_DAYS {
        info!(source_id = source.id, to = target, "Temporary redirect promoted to permanent");
        source.feed_url = target.to_owned();
        source.last_302_url = None;
        source.last_302_start = None;
        set_result(source, format!("Permanent Redirect to {target}"));
    } else {
        set_result(
            source,
            format!("Temporary Redirect to {target} since {}", since.format("%d %B")),
        );
    }
}

// ============================================================================
// HTTP helpers
// ============================================================================

fn set_result(source: &mut Source, message: impl Into<String>) {
    let message = message.into();
    source.last_result = Some(truncate_chars(&message, MAX_RESULT_CHARS).into_owned());
}

fn request_headers(agent: &str, etag: Option<&str>, last_modified: Option<&str>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    let pairs = [
        (header::USER_AGENT, Some(agent)),
        (header::IF_NONE_MATCH, etag),
        (header::IF_MODIFIED_SINCE, last_modified),
    ];
    for (name, value) in pairs {
        let Some(value) = value.filter(|v| !v.is_empty()) else {
            continue;
        };
        match HeaderValue::from_str(value) {
            Ok(value) => {
                headers.insert(name, value);
            }
            Err(_) => debug!(header = %name, "Dropping header value that is not valid HTTP"),
        }
    }
    headers
}

async fn send(
    client: &reqwest::Client,
    url: &str,
    headers: HeaderMap,
    timeout: Duration,
) -> Result<reqwest::Response, FetchError> {
    tokio::time::timeout(timeout, client.get(url).headers(headers).send())
        .await
        .map_err(|_| FetchError::Timeout)?
        .map_err(FetchError::Network)
}

fn header_string(response: &reqwest::Response, name: header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

fn location(response: &reqwest::Response) -> Option<String> {
    header_string(response, header::LOCATION).filter(|l| !l.trim().is_empty())
}

/// Read the body, refusing anything over `limit` bytes.
async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    let expected_length = response.content_length();

    if let Some(len) = expected_length {
        if len > limit as u64 {
            return Err(FetchError::ResponseTooLarge(limit));
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge(limit));
        }
        bytes.extend_from_slice(&chunk);
    }

    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(FetchError::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}

/// Marks a source as being polled until dropped.
struct InFlight {
    set: Arc<Mutex<HashSet<i64>>>,
    source_id: i64,
}

impl InFlight {
    fn claim(set: &Arc<Mutex<HashSet<i64>>>, source_id: i64) -> Option<Self> {
        let mut ids = set.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        ids.insert(source_id).then(|| Self {
            set: Arc::clone(set),
            source_id,
        })
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let mut ids = self.set.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        ids.remove(&self.source_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::NewSource;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
    <title>Test Feed</title>
    <link>https://site.example.com/</link>
    <item><guid>b</guid><title>Second</title><pubDate>Tue, 02 Jan 2024 10:00:00 GMT</pubDate><description>two</description></item>
    <item><guid>a</guid><title>First</title><pubDate>Mon, 01 Jan 2024 10:00:00 GMT</pubDate><description>one</description></item>
</channel></rss>"#;

    const JSON_FEED: &str = r#"{
        "version": "https://jsonfeed.org/version/1.1",
        "title": "JSON Test",
        "items": [
            {"id": "p2", "content_html": "<p>Second post body</p>", "date_published": "2024-01-02T00:00:00Z"},
            {"content_text": "First post body", "date_published": "2024-01-01T00:00:00Z"}
        ]
    }"#;

    fn settings() -> PollSettings {
        PollSettings {
            user_agent: "feedpoll-test/1".into(),
            server: "test.local".into(),
            fetch_timeout: Duration::from_secs(5),
            max_feed_bytes: 64 * 1024,
            excerpt_chars: 300,
            concurrency: 2,
        }
    }

    async fn poller_with_list(list_url: String) -> Poller {
        let db = Database::open(":memory:").await.unwrap();
        let proxies = ProxyPool::new(db.clone(), reqwest::Client::new(), list_url, 3);
        Poller::new(db, settings(), proxies).unwrap()
    }

    async fn add_source(poller: &Poller, feed_url: String) -> Source {
        let id = poller.db().insert_source(&NewSource::new(feed_url)).await.unwrap();
        poller.db().get_source(id).await.unwrap().unwrap()
    }

    async fn setup(server: &MockServer, feed_path: &str) -> (Poller, Source) {
        let poller = poller_with_list(format!("{}/proxies.txt", server.uri())).await;
        let source = add_source(&poller, format!("{}{}", server.uri(), feed_path)).await;
        (poller, source)
    }

    async fn poll(poller: &Poller, source: Source) -> (PollSummary, Source) {
        let id = source.id;
        let summary = poller.poll_source(source).await.result.unwrap();
        let stored = poller.db().get_source(id).await.unwrap().unwrap();
        (summary, stored)
    }

    /// A local port with nothing listening on it
    fn closed_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    fn proxy_list(addresses: &[String]) -> String {
        format!("header 1\nheader 2\nheader 3\n\n{}\n", addresses.join("\n"))
    }

    async fn mount(server: &MockServer, at: &str, response: ResponseTemplate) {
        Mock::given(method("GET"))
            .and(path(at))
            .respond_with(response)
            .mount(server)
            .await;
    }

    // ========================================================================
    // Success paths
    // ========================================================================

    #[tokio::test]
    async fn test_rss_success_then_unchanged() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed"))
            .and(header("User-Agent", "feedpoll-test/1 (+test.local; Updater; 1 subscribers)"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(RSS)
                    .insert_header("Content-Type", "application/rss+xml")
                    .insert_header("ETag", "\"v1\"")
                    .insert_header("Last-Modified", "Tue, 02 Jan 2024 10:00:00 GMT"),
            )
            .mount(&server)
            .await;

        let (poller, source) = setup(&server, "/feed").await;
        let (summary, stored) = poll(&poller, source).await;

        assert_eq!(summary.status_code, 200);
        assert_eq!(summary.last_result.as_deref(), Some("OK (updated)"));
        assert_eq!(summary.stats.inserted, 2);
        assert_eq!(stored.interval, 200);
        assert_eq!(stored.etag.as_deref(), Some("\"v1\""));
        assert_eq!(stored.last_modified.as_deref(), Some("Tue, 02 Jan 2024 10:00:00 GMT"));
        assert_eq!(stored.name.as_deref(), Some("Test Feed"));
        assert_eq!(stored.site_url.as_deref(), Some("https://site.example.com/"));
        assert!(stored.last_change.is_some());
        assert_eq!(stored.max_index, 2);

        let posts = poller.db().get_posts_for_source(stored.id).await.unwrap();
        let order: Vec<(&str, i64)> = posts.iter().map(|p| (p.guid.as_str(), p.index)).collect();
        assert_eq!(order, vec![("a", 1), ("b", 2)]);

        // Same document again: nothing new, gentle backoff
        let (summary, stored) = poll(&poller, stored).await;
        assert_eq!(summary.last_result.as_deref(), Some("OK"));
        assert_eq!(summary.stats.inserted, 0);
        assert_eq!(summary.stats.updated, 2);
        assert_eq!(stored.interval, 220);
        assert_eq!(stored.max_index, 2);

        let again = poller.db().get_posts_for_source(stored.id).await.unwrap();
        let order: Vec<(&str, i64)> = again.iter().map(|p| (p.guid.as_str(), p.index)).collect();
        assert_eq!(order, vec![("a", 1), ("b", 2)]);
    }

    #[tokio::test]
    async fn test_json_feed_first_poll() {
        let server = MockServer::start().await;
        mount(
            &server,
            "/feed.json",
            ResponseTemplate::new(200)
                .set_body_string(JSON_FEED)
                .insert_header("Content-Type", "application/feed+json"),
        )
        .await;

        let (poller, source) = setup(&server, "/feed.json").await;
        assert_eq!(source.interval, 400);

        let before = Utc::now().timestamp();
        let (summary, stored) = poll(&poller, source).await;

        assert_eq!(summary.last_result.as_deref(), Some("OK (updated)"));
        assert_eq!(stored.interval, 200);
        assert!((stored.due_poll - (before + 200 * 60)).abs() <= 5);

        let posts = poller.db().get_posts_for_source(stored.id).await.unwrap();
        assert_eq!(posts.len(), 2);
        let hashed = format!("{:x}", md5::compute("First post body"));
        assert_eq!(posts[0].guid, hashed);
        assert_eq!(posts[0].index, 1);
        assert_eq!(posts[0].body, "First post body");
        assert_eq!(posts[1].guid, "p2");
        assert_eq!(posts[1].index, 2);
    }

    // ========================================================================
    // Status handling
    // ========================================================================

    #[tokio::test]
    async fn test_not_found_backs_off() {
        let server = MockServer::start().await;
        mount(&server, "/feed", ResponseTemplate::new(404)).await;

        let (poller, source) = setup(&server, "/feed").await;
        let (summary, stored) = poll(&poller, source).await;

        assert_eq!(summary.status_code, 404);
        assert_eq!(stored.last_result.as_deref(), Some("The feed could not be found"));
        assert_eq!(stored.interval, 520);
        assert!(stored.live);
    }

    #[tokio::test]
    async fn test_server_error_backs_off() {
        let server = MockServer::start().await;
        mount(&server, "/feed", ResponseTemplate::new(503)).await;

        let (poller, source) = setup(&server, "/feed").await;
        let (_, stored) = poll(&poller, source).await;

        assert_eq!(stored.last_result.as_deref(), Some("Server error fetching feed (503)"));
        assert_eq!(stored.interval, 520);
    }

    #[tokio::test]
    async fn test_bad_request_kills_source() {
        let server = MockServer::start().await;
        mount(&server, "/feed", ResponseTemplate::new(400)).await;

        let (poller, source) = setup(&server, "/feed").await;
        let (_, stored) = poll(&poller, source).await;

        assert!(!stored.live);
        assert_eq!(stored.last_result.as_deref(), Some("Bad request (400)"));
        assert_eq!(stored.interval, 400);
    }

    #[tokio::test]
    async fn test_gone_without_cloudflare_kills_source() {
        let server = MockServer::start().await;
        mount(&server, "/feed", ResponseTemplate::new(410).set_body_string("gone")).await;

        let (poller, source) = setup(&server, "/feed").await;
        let (_, stored) = poll(&poller, source).await;

        assert!(!stored.live);
        assert!(!stored.is_cloudflare);
        assert_eq!(stored.last_result.as_deref(), Some("Feed is no longer accessible."));
    }

    #[tokio::test]
    async fn test_cloudflare_server_header_flags_source() {
        let server = MockServer::start().await;
        mount(
            &server,
            "/feed",
            ResponseTemplate::new(403).insert_header("Server", "cloudflare"),
        )
        .await;

        let (poller, source) = setup(&server, "/feed").await;
        let (_, stored) = poll(&poller, source).await;

        assert!(stored.is_cloudflare);
        assert!(stored.live);
        assert_eq!(stored.last_result.as_deref(), Some("Blocked by Cloudflare"));
    }

    #[tokio::test]
    async fn test_cloudflare_body_marker_flags_source() {
        let server = MockServer::start().await;
        mount(
            &server,
            "/feed",
            ResponseTemplate::new(403).set_body_string("<html>Attention Required! | Cloudflare</html>"),
        )
        .await;

        let (poller, source) = setup(&server, "/feed").await;
        let (_, stored) = poll(&poller, source).await;

        assert!(stored.is_cloudflare);
        assert!(stored.live);
    }

    #[tokio::test]
    async fn test_not_modified_keeps_cache() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed"))
            .and(header("If-None-Match", "\"v1\""))
            .respond_with(ResponseTemplate::new(304))
            .mount(&server)
            .await;

        let (poller, mut source) = setup(&server, "/feed").await;
        source.etag = Some("\"v1\"".into());
        source.last_success = Some(Utc::now().timestamp() - 86_400);
        poller.db().save_source(&source).await.unwrap();

        let (_, stored) = poll(&poller, source).await;
        assert_eq!(stored.status_code, 304);
        assert_eq!(stored.last_result.as_deref(), Some("Not modified"));
        assert_eq!(stored.etag.as_deref(), Some("\"v1\""));
        assert_eq!(stored.interval, 410);
    }

    #[tokio::test]
    async fn test_stale_not_modified_clears_cache() {
        let server = MockServer::start().await;
        mount(&server, "/feed", ResponseTemplate::new(304)).await;

        let (poller, mut source) = setup(&server, "/feed").await;
        let now = Utc::now().timestamp();
        source.etag = Some("\"v1\"".into());
        source.last_modified = Some("Mon, 01 Jan 2024 00:00:00 GMT".into());
        source.last_success = Some(now - 10 * 86_400);
        poller.db().save_source(&source).await.unwrap();

        let (_, stored) = poll(&poller, source).await;
        assert_eq!(stored.etag, None);
        assert_eq!(stored.last_modified, None);
        assert!(stored.last_result.unwrap().contains("lack of changes"));
        assert_eq!(stored.interval, 410);
        assert!(stored.last_success.unwrap() >= now);
    }

    #[tokio::test]
    async fn test_permanent_redirect_rewrites_url() {
        let server = MockServer::start().await;
        mount(
            &server,
            "/old",
            ResponseTemplate::new(301).insert_header("Location", "/moved/feed"),
        )
        .await;

        let (poller, source) = setup(&server, "/old").await;
        let (_, stored) = poll(&poller, source).await;

        assert_eq!(stored.feed_url, format!("{}/moved/feed", server.uri()));
        assert_eq!(stored.last_result.as_deref(), Some("Moved"));
        assert_eq!(stored.interval, 400);
    }

    #[tokio::test]
    async fn test_permanent_redirect_without_location() {
        let server = MockServer::start().await;
        mount(&server, "/old", ResponseTemplate::new(308)).await;

        let (poller, source) = setup(&server, "/old").await;
        let url = source.feed_url.clone();
        let (_, stored) = poll(&poller, source).await;

        assert_eq!(stored.feed_url, url);
        assert_eq!(
            stored.last_result.as_deref(),
            Some("Feed has moved but no location provided")
        );
    }

    // ========================================================================
    // Temporary redirects
    // ========================================================================

    #[tokio::test]
    async fn test_temporary_redirect_is_followed_and_tracked() {
        let server = MockServer::start().await;
        mount(&server, "/old", ResponseTemplate::new(302).insert_header("Location", "/new")).await;
        mount(
            &server,
            "/new",
            ResponseTemplate::new(200)
                .set_body_string(JSON_FEED)
                .insert_header("Content-Type", "application/json")
                .insert_header("ETag", "\"new\""),
        )
        .await;

        let (poller, mut source) = setup(&server, "/old").await;
        source.etag = Some("\"old\"".into());
        poller.db().save_source(&source).await.unwrap();
        let old_url = source.feed_url.clone();

        let (summary, stored) = poll(&poller, source).await;

        assert_eq!(summary.stats.inserted, 2);
        assert_eq!(stored.status_code, 200);
        assert_eq!(stored.feed_url, old_url);
        assert_eq!(stored.last_302_url, Some(format!("{}/new", server.uri())));
        assert!(stored.last_302_start.is_some());
        // Validators from a redirected response are not kept
        assert_eq!(stored.etag, None);
        assert_eq!(stored.last_result.as_deref(), Some("OK (updated)"));
    }

    #[tokio::test]
    async fn test_long_standing_temporary_redirect_is_promoted() {
        let server = MockServer::start().await;
        mount(&server, "/old", ResponseTemplate::new(307).insert_header("Location", "/new")).await;
        mount(&server, "/new", ResponseTemplate::new(500)).await;

        let (poller, mut source) = setup(&server, "/old").await;
        let target = format!("{}/new", server.uri());
        source.last_302_url = Some(target.clone());
        source.last_302_start = Some(Utc::now().timestamp() - 61 * 86_400);
        poller.db().save_source(&source).await.unwrap();

        let (_, stored) = poll(&poller, source).await;

        assert_eq!(stored.feed_url, target);
        assert_eq!(stored.last_302_url, None);
        assert_eq!(stored.last_302_start, None);
        assert_eq!(stored.last_result, Some(format!("Permanent Redirect to {target}")));
        assert_eq!(stored.status_code, 500);
    }

    #[tokio::test]
    async fn test_recent_temporary_redirect_is_not_promoted() {
        let server = MockServer::start().await;
        mount(&server, "/old", ResponseTemplate::new(302).insert_header("Location", "/new")).await;
        mount(&server, "/new", ResponseTemplate::new(500)).await;

        let (poller, mut source) = setup(&server, "/old").await;
        let old_url = source.feed_url.clone();
        let target = format!("{}/new", server.uri());
        let started = Utc::now().timestamp() - 30 * 86_400;
        source.last_302_url = Some(target.clone());
        source.last_302_start = Some(started);
        poller.db().save_source(&source).await.unwrap();

        let (_, stored) = poll(&poller, source).await;

        assert_eq!(stored.feed_url, old_url);
        assert_eq!(stored.last_302_start, Some(started));
        let result = stored.last_result.unwrap();
        assert!(result.starts_with(&format!("Temporary Redirect to {target} since ")));
        assert_eq!(stored.interval, 400);
    }

    #[tokio::test]
    async fn test_temporary_redirect_without_location() {
        let server = MockServer::start().await;
        mount(&server, "/old", ResponseTemplate::new(302)).await;

        let (poller, source) = setup(&server, "/old").await;
        let (_, stored) = poll(&poller, source).await;

        assert!(stored.last_result.unwrap().starts_with("Failed redirection"));
        assert_eq!(stored.interval, 460);
    }

    #[test]
    fn test_not_modified_counts_whole_days() {
        let now = Utc::now();
        let mut source = crate::feed::testing::source("https://a.example.com/rss");
        source.etag = Some("\"v1\"".into());

        // Seven days and some hours is still seven whole days
        source.last_success = Some(now.timestamp() - 7 * 86_400 - 3_600);
        not_modified(&mut source, now);
        assert_eq!(source.etag.as_deref(), Some("\"v1\""));
        assert_eq!(source.last_result.as_deref(), Some("Not modified"));

        source.last_success = Some(now.timestamp() - 8 * 86_400);
        not_modified(&mut source, now);
        assert_eq!(source.etag, None);
        assert_eq!(source.last_success, Some(now.timestamp()));
    }

    #[test]
    fn test_track_redirect_boundary() {
        let now = Utc::now();
        let mut source = crate::feed::testing::source("https://a.example.com/rss");
        source.last_302_url = Some("https://b.example.com/rss".into());
        source.last_302_start = Some(now.timestamp() - 60 * 86_400);

        // Exactly 60 days is not "more than 60"
        track_temporary_redirect(&mut source, "https://b.example.com/rss", now);
        assert_eq!(source.feed_url, "https://a.example.com/rss");

        // A different target restarts the clock
        track_temporary_redirect(&mut source, "https://c.example.com/rss", now);
        assert_eq!(source.last_302_url.as_deref(), Some("https://c.example.com/rss"));
        assert_eq!(source.last_302_start, Some(now.timestamp()));
    }

    // ========================================================================
    // Transport failures and body handling
    // ========================================================================

    #[tokio::test]
    async fn test_connection_failure_without_proxy() {
        let poller = poller_with_list("http://127.0.0.1:9/proxies.txt".into()).await;
        let source = add_source(&poller, format!("http://127.0.0.1:{}/feed", closed_port())).await;

        let (summary, stored) = poll(&poller, source).await;
        assert_eq!(summary.status_code, 0);
        assert!(stored.last_result.unwrap().starts_with("Fetch error: "));
        assert_eq!(stored.interval, 520);
    }

    #[tokio::test]
    async fn test_oversized_body_rejected() {
        let server = MockServer::start().await;
        let huge = format!("<rss>{}</rss>", "x".repeat(100 * 1024));
        mount(&server, "/feed", ResponseTemplate::new(200).set_body_string(huge)).await;

        let (poller, source) = setup(&server, "/feed").await;
        let (summary, stored) = poll(&poller, source).await;

        assert_eq!(summary.stats.inserted, 0);
        assert!(stored.last_result.unwrap().starts_with("Feed too large"));
        assert_eq!(stored.interval, 520);
    }

    #[tokio::test]
    async fn test_unknown_content_type() {
        let server = MockServer::start().await;
        mount(
            &server,
            "/feed",
            ResponseTemplate::new(200)
                .set_body_string("just text")
                .insert_header("Content-Type", "text/plain"),
        )
        .await;

        let (poller, source) = setup(&server, "/feed").await;
        let (_, stored) = poll(&poller, source).await;

        assert_eq!(stored.last_result.as_deref(), Some("Unknown feed type: text/plain"));
        assert_eq!(stored.interval, 520);
    }

    #[tokio::test]
    async fn test_broken_json_backs_off_twice() {
        let server = MockServer::start().await;
        mount(
            &server,
            "/feed",
            ResponseTemplate::new(200)
                .set_body_string("{ nope")
                .insert_header("Content-Type", "application/json"),
        )
        .await;

        let (poller, source) = setup(&server, "/feed").await;
        let (_, stored) = poll(&poller, source).await;

        assert_eq!(stored.last_result.as_deref(), Some("Feed Parse Error"));
        assert_eq!(stored.interval, 640);
    }

    #[tokio::test]
    async fn test_expired_json_feed_goes_daily() {
        let server = MockServer::start().await;
        mount(
            &server,
            "/feed",
            ResponseTemplate::new(200)
                .set_body_string(r#"{"expired": true, "items": [{"id": "1"}]}"#)
                .insert_header("Content-Type", "application/json"),
        )
        .await;

        let (poller, source) = setup(&server, "/feed").await;
        let (summary, stored) = poll(&poller, source).await;

        assert_eq!(summary.stats.inserted, 0);
        assert_eq!(stored.last_result.as_deref(), Some("This feed has expired"));
        assert_eq!(stored.interval, 1440);
    }

    // ========================================================================
    // Proxies
    // ========================================================================

    #[tokio::test]
    async fn test_proxy_failure_burns_proxy_and_halves() {
        let list_server = MockServer::start().await;
        let dead_proxy = format!("127.0.0.1:{}", closed_port());
        mount(
            &list_server,
            "/proxies.txt",
            ResponseTemplate::new(200).set_body_string(proxy_list(&[dead_proxy, "10.0.0.1:80".into()])),
        )
        .await;

        let poller = poller_with_list(format!("{}/proxies.txt", list_server.uri())).await;
        let mut source = add_source(&poller, "http://feed.invalid/rss".into()).await;
        source.is_cloudflare = true;
        poller.db().save_source(&source).await.unwrap();

        let (summary, stored) = poll(&poller, source).await;

        assert_eq!(summary.status_code, 1);
        assert_eq!(stored.interval, 200);
        assert!(stored.last_result.unwrap().contains("Proxy failed"));
        let remaining = poller.db().first_proxy().await.unwrap().unwrap();
        assert_eq!(remaining.address, "10.0.0.1:80");
    }

    #[tokio::test]
    async fn test_cloudflare_through_proxy_burns_proxy() {
        // The feed server doubles as the proxy and blocks everything
        let feed_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403).insert_header("Server", "cloudflare"))
            .mount(&feed_server)
            .await;

        let list_server = MockServer::start().await;
        let proxy = feed_server.address().to_string();
        mount(
            &list_server,
            "/proxies.txt",
            ResponseTemplate::new(200).set_body_string(proxy_list(&[proxy.clone(), proxy])),
        )
        .await;

        let poller = poller_with_list(format!("{}/proxies.txt", list_server.uri())).await;
        let mut source = add_source(&poller, format!("{}/feed", feed_server.uri())).await;
        source.is_cloudflare = true;
        poller.db().save_source(&source).await.unwrap();

        let (_, stored) = poll(&poller, source).await;

        assert!(stored.is_cloudflare);
        assert_eq!(stored.interval, 200);
        assert_eq!(
            stored.last_result.as_deref(),
            Some("Proxy kind of worked but still got cloudflared")
        );
        assert_eq!(poller.db().count_proxies().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_cloudflare_source_falls_back_to_direct_fetch() {
        let server = MockServer::start().await;
        mount(&server, "/proxies.txt", ResponseTemplate::new(404)).await;
        mount(
            &server,
            "/feed",
            ResponseTemplate::new(200)
                .set_body_string(RSS)
                .insert_header("Content-Type", "application/rss+xml"),
        )
        .await;

        let (poller, mut source) = setup(&server, "/feed").await;
        source.is_cloudflare = true;
        poller.db().save_source(&source).await.unwrap();

        let (summary, _) = poll(&poller, source).await;

        assert_eq!(summary.last_result.as_deref(), Some("OK (updated)"));
        // Sentinels stay until the batch purges them
        assert_eq!(poller.db().count_proxies().await.unwrap(), 3);
    }

    // ========================================================================
    // In-flight guard
    // ========================================================================

    #[tokio::test]
    async fn test_source_already_in_flight_is_skipped() {
        let poller = poller_with_list("http://127.0.0.1:9/proxies.txt".into()).await;
        let source = add_source(&poller, "http://feed.invalid/rss".into()).await;

        let claim = InFlight::claim(&poller.in_flight, source.id).unwrap();
        assert!(InFlight::claim(&poller.in_flight, source.id).is_none());

        let report = poller.poll_source(source.clone()).await;
        assert!(matches!(report.result, Err(PollError::InFlight(id)) if id == source.id));

        drop(claim);
        assert!(InFlight::claim(&poller.in_flight, source.id).is_some());
    }
}
