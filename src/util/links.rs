use thiserror::Error;
use url::Url;

/// Reasons a feed address is refused at subscription time.
#[derive(Error, Debug)]
pub enum UrlValidationError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("Unsupported scheme: {0} (only http/https allowed)")]
    UnsupportedScheme(String),
    #[error("URL has no host")]
    MissingHost,
}

/// Parses a feed address and checks that the poller can fetch it.
///
/// ```
/// use feedpoll::util::validate_feed_url;
///
/// assert!(validate_feed_url("https://example.com/feed.xml").is_ok());
/// assert!(validate_feed_url("file:///etc/passwd").is_err());
/// ```
pub fn validate_feed_url(url_str: &str) -> Result<Url, UrlValidationError> {
    let url = Url::parse(url_str.trim())?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => return Err(UrlValidationError::UnsupportedScheme(scheme.to_owned())),
    }

    if url.host_str().map_or(true, str::is_empty) {
        return Err(UrlValidationError::MissingHost);
    }

    Ok(url)
}

/// Resolves a `Location` header value against the URL that produced it.
///
/// Absolute locations pass through unchanged; relative ones are joined onto
/// `base`. Returns `None` when neither interpretation parses.
pub fn resolve_location(base: &str, location: &str) -> Option<String> {
    let location = location.trim();
    if location.is_empty() {
        return None;
    }

    match Url::parse(location) {
        Ok(url) => Some(url.into()),
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            let joined = Url::parse(base).ok()?.join(location).ok()?;
            Some(joined.into())
        }
        Err(_) => None,
    }
}

/// `scheme://host[:port]` of a site URL, without a trailing slash.
pub fn site_origin(site_url: &str) -> Option<(String, String)> {
    let url = Url::parse(site_url).ok()?;
    let host = url.host_str()?;
    let origin = match url.port() {
        Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
        None => format!("{}://{}", url.scheme(), host),
    };
    Some((url.scheme().to_owned(), origin))
}
