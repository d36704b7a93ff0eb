//! Rotating HTTP proxy pool for Cloudflare-protected sources.
//!
//! Proxies are consumed oldest-first and discarded ("burned") as soon as one
//! fails. When the pool runs dry it is refilled from a public plain-text
//! list. If that refill produces nothing, sentinel entries ([`DEAD_PROXY`])
//! are stored instead so a broken list is not re-downloaded on every poll;
//! the scheduler purges them after each batch.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::storage::{Database, Proxy, DEAD_PROXY};

pub const PROXY_LIST_URL: &str =
    "https://raw.githubusercontent.com/clarketm/proxy-list/master/proxy-list.txt";

/// Lines of preamble at the top of the list
const HEADER_LINES: usize = 4;

const LIST_TIMEOUT: Duration = Duration::from_secs(30);

/// Extract `host:port` addresses from the proxy list body.
///
/// Skips the preamble, keeps lines containing a colon and takes the first
/// space-separated token of each.
pub fn parse_proxy_list(text: &str) -> Vec<String> {
    text.lines()
        .skip(HEADER_LINES)
        .filter(|line| line.contains(':'))
        .filter_map(|line| line.split(' ').next())
        .map(str::trim)
        .filter(|address| !address.is_empty())
        .map(str::to_owned)
        .collect()
}

#[derive(Clone)]
pub struct ProxyPool {
    db: Database,
    client: reqwest::Client,
    list_url: String,
    dead_count: usize,
    // Serializes get-or-refill so concurrent polls don't all download the list
    refill: Arc<Mutex<()>>,
}

impl ProxyPool {
    pub fn new(
        db: Database,
        client: reqwest::Client,
        list_url: impl Into<String>,
        dead_count: usize,
    ) -> Self {
        Self {
            db,
            client,
            list_url: list_url.into(),
            dead_count,
            refill: Arc::new(Mutex::new(())),
        }
    }

    /// Oldest proxy in the pool, refilling it first if empty.
    ///
    /// Never fails for lack of proxies: the worst case is a sentinel, which
    /// callers treat as "fetch directly".
    pub async fn get_proxy(&self) -> Result<Proxy> {
        let _guard = self.refill.lock().await;

        if let Some(proxy) = self.db.first_proxy().await? {
            return Ok(proxy);
        }

        self.find_proxies().await?;

        let proxy = self.db.first_proxy().await?.unwrap_or_else(|| Proxy {
            id: 0,
            address: DEAD_PROXY.to_owned(),
        });
        debug!(proxy = %proxy.address, "Selected proxy");
        Ok(proxy)
    }

    /// Download the public list into the pool. Returns how many usable
    /// addresses were added.
    ///
    /// Download failures are logged, not returned. When the pool is still
    /// empty afterwards it is seeded with sentinels.
    pub async fn find_proxies(&self) -> Result<usize> {
        info!(url = %self.list_url, "Looking for proxies");

        let added = match self.download().await {
            Ok(addresses) => {
                self.db
                    .insert_proxies(&addresses)
                    .await
                    .context("Failed to store proxies")?;
                addresses.len()
            }
            Err(e) => {
                warn!(error = %e, "Proxy list download failed");
                0
            }
        };

        if self.db.count_proxies().await? == 0 {
            warn!(sentinels = self.dead_count, "No proxies found");
            let sentinels = vec![DEAD_PROXY.to_owned(); self.dead_count];
            self.db.insert_proxies(&sentinels).await?;
        } else {
            info!(added, "Proxy pool refilled");
        }

        Ok(added)
    }

    async fn download(&self) -> Result<Vec<String>> {
        let response = tokio::time::timeout(LIST_TIMEOUT, self.client.get(&self.list_url).send())
            .await
            .context("Proxy list request timed out")??;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            anyhow::bail!("Proxy list returned HTTP {}", status);
        }

        let text = response.text().await?;
        Ok(parse_proxy_list(&text))
    }

    /// Remove a proxy that just failed. Sentinels and unsaved entries are
    /// ignored.
    pub async fn burn(&self, proxy: &Proxy) -> Result<bool> {
        if proxy.is_dead() || proxy.id == 0 {
            return Ok(false);
        }
        info!(proxy = %proxy.address, "Burning proxy");
        self.db.delete_proxy(proxy.id).await
    }

    pub async fn purge_dead(&self) -> Result<u64> {
        self.db.purge_dead_proxies().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const LIST: &str = "Proxy list updated 2024-01-01\n\
        Format: IP:PORT COUNTRY-ANONYMITY\n\
        Source: example\n\
        \n\
        1.2.3.4:8080 US-H-S +\n\
        5.6.7.8:3128 DE-A -\n\
        not a proxy line\n\
        9.9.9.9:80\n";

    async fn pool_for(server: &MockServer) -> ProxyPool {
        let db = Database::open(":memory:").await.unwrap();
        ProxyPool::new(db, reqwest::Client::new(), format!("{}/proxies.txt", server.uri()), 20)
    }

    #[test]
    fn test_parse_proxy_list() {
        assert_eq!(
            parse_proxy_list(LIST),
            vec!["1.2.3.4:8080", "5.6.7.8:3128", "9.9.9.9:80"]
        );
    }

    #[test]
    fn test_parse_short_list() {
        assert!(parse_proxy_list("a:1\nb:2\nc:3\nd:4").is_empty());
        assert!(parse_proxy_list("").is_empty());
    }

    #[tokio::test]
    async fn test_get_proxy_refills_empty_pool() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/proxies.txt"))
            .respond_with(ResponseTemplate::new(200).set_body_string(LIST))
            .expect(1)
            .mount(&server)
            .await;

        let pool = pool_for(&server).await;
        let first = pool.get_proxy().await.unwrap();
        assert_eq!(first.address, "1.2.3.4:8080");

        // Pool is now populated: no second download
        let again = pool.get_proxy().await.unwrap();
        assert_eq!(again, first);

        assert!(pool.burn(&first).await.unwrap());
        assert_eq!(pool.get_proxy().await.unwrap().address, "5.6.7.8:3128");
    }

    #[tokio::test]
    async fn test_failed_download_seeds_sentinels() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let pool = pool_for(&server).await;
        let proxy = pool.get_proxy().await.unwrap();
        assert!(proxy.is_dead());
        assert_eq!(pool.db.count_proxies().await.unwrap(), 20);

        // Sentinels are never burned individually
        assert!(!pool.burn(&proxy).await.unwrap());
        assert_eq!(pool.purge_dead().await.unwrap(), 20);
        assert_eq!(pool.db.count_proxies().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_empty_list_seeds_sentinels() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("header only\n"))
            .mount(&server)
            .await;

        let pool = pool_for(&server).await;
        assert_eq!(pool.find_proxies().await.unwrap(), 0);
        assert!(pool.get_proxy().await.unwrap().is_dead());
    }

    #[tokio::test]
    async fn test_concurrent_get_downloads_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(LIST))
            .expect(1)
            .mount(&server)
            .await;

        let pool = pool_for(&server).await;
        let (a, b) = tokio::join!(pool.get_proxy(), pool.get_proxy());
        assert_eq!(a.unwrap(), b.unwrap());
    }
}
