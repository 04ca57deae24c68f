//! Common utilities shared across the crate

pub mod retry;

use url::Url;

/// Host part of a URL, for log fields
pub fn host_of(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()
        .and_then(|parsed| parsed.host_str().map(str::to_string))
}

/// Whether a string is an absolute http(s) URL
pub fn is_http_url(url: &str) -> bool {
    Url::parse(url).is_ok_and(|parsed| matches!(parsed.scheme(), "http" | "https"))
}
