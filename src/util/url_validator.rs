use thiserror::Error;
use url::Url;

/// Why a string was refused as a source url.
#[derive(Error, Debug)]
pub enum SourceUrlError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("Unsupported scheme: {0} (only http/https allowed)")]
    UnsupportedScheme(String),
    #[error("URL has no host")]
    MissingHost,
}

/// Check that `url_str` can identify a feed source: an absolute http(s) url
/// with a host.
///
/// The string itself is what the store keys on, so callers should store the
/// input unchanged rather than the normalized [`Url`] returned here.
///
/// ```
/// use riffle::util::validate_source_url;
///
/// assert!(validate_source_url("https://example.com/feed.xml").is_ok());
/// assert!(validate_source_url("file:///etc/passwd").is_err());
/// assert!(validate_source_url("example.com/feed").is_err());
/// ```
pub fn validate_source_url(url_str: &str) -> Result<Url, SourceUrlError> {
    let url = Url::parse(url_str)?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => return Err(SourceUrlError::UnsupportedScheme(scheme.to_owned())),
    }

    if url.host_str().map_or(true, str::is_empty) {
        return Err(SourceUrlError::MissingHost);
    }

    Ok(url)
}
