//! Feed fetch collaborator
//!
//! Workers only see the [`FeedFetcher`] trait. The default [`HttpFetcher`]
//! performs a conditional GET and hands the body to `feed-rs`; everything
//! about feed formats stays inside that crate.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::FetchConfig;
use crate::models::RawItem;

// ============================================================================
// Errors
// ============================================================================

/// Errors that can occur while fetching one source URL
///
/// The display strings double as failure reasons on FailRecords.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Request timeout
    #[error("Request timed out")]
    Timeout,

    /// Connection or protocol failure
    #[error("Connection failed: {0}")]
    Request(String),

    /// Non-success status code
    #[error("Bad status code ({0})")]
    Status(u16),

    /// Body is not a valid feed
    #[error("Not a valid feed: {0}")]
    Parse(String),
}

impl FetchError {
    /// Check if a later attempt may succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Timeout | Self::Request(_) => true,
            Self::Status(code) => *code == 429 || *code >= 500,
            Self::Parse(_) => false,
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if let Some(status) = err.status() {
            Self::Status(status.as_u16())
        } else {
            Self::Request(err.to_string())
        }
    }
}

/// Result type for fetch operations
pub type FetchResult<T> = std::result::Result<T, FetchError>;

// ============================================================================
// Types
// ============================================================================

/// Conditional-request validators remembered per URL
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedHeaders {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
}

impl CachedHeaders {
    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }
}

/// Result of one successful fetch
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    /// The server confirmed the cached validators
    NotModified,

    /// A fresh document was parsed
    Fetched {
        items: Vec<RawItem>,
        headers: CachedHeaders,
    },
}

/// Fetches and parses one source URL
#[async_trait]
pub trait FeedFetcher: Send + Sync {
    async fn fetch(&self, url: &str, cached: Option<&CachedHeaders>) -> FetchResult<FetchOutcome>;
}

// ============================================================================
// HTTP fetcher
// ============================================================================

/// `reqwest` + `feed-rs` fetcher
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    /// Create a fetcher from configuration
    pub fn new(config: &FetchConfig) -> FetchResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .user_agent(config.user_agent.clone())
            .gzip(true)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl FeedFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, cached: Option<&CachedHeaders>) -> FetchResult<FetchOutcome> {
        let mut request = self.client.get(url);
        if let Some(cached) = cached {
            if let Some(etag) = &cached.etag {
                request = request.header(IF_NONE_MATCH, etag);
            }
            if let Some(last_modified) = &cached.last_modified {
                request = request.header(IF_MODIFIED_SINCE, last_modified);
            }
        }

        let response = request.send().await?;
        let status = response.status();
        if status == StatusCode::NOT_MODIFIED {
            return Ok(FetchOutcome::NotModified);
        }
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        let header = |name| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(String::from)
        };
        let headers = CachedHeaders {
            etag: header(ETAG),
            last_modified: header(LAST_MODIFIED),
        };

        let bytes = response.bytes().await?;
        let items = parse_items(&bytes)?;
        Ok(FetchOutcome::Fetched { items, headers })
    }
}

/// Parse a feed document into raw items
pub fn parse_items(body: &[u8]) -> FetchResult<Vec<RawItem>> {
    let feed = feed_rs::parser::parse(body).map_err(|e| FetchError::Parse(e.to_string()))?;

    let items = feed
        .entries
        .into_iter()
        .map(|entry| {
            let mut extra = BTreeMap::new();
            if !entry.categories.is_empty() {
                let terms: Vec<_> = entry.categories.iter().map(|c| c.term.as_str()).collect();
                extra.insert("categories".to_string(), terms.join(", "));
            }
            if let Some(updated) = entry.updated {
                extra.insert("updated".to_string(), updated.to_rfc3339());
            }

            let description = entry
                .summary
                .map(|s| s.content)
                .or_else(|| entry.content.and_then(|c| c.body));

            RawItem {
                guid: Some(entry.id).filter(|id| !id.is_empty()),
                link: entry.links.first().map(|l| l.href.clone()),
                title: entry.title.map(|t| t.content),
                description,
                author: entry.authors.first().map(|a| a.name.clone()),
                published: entry.published.or(entry.updated),
                extra,
            }
        })
        .collect();

    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    const RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0">
  <channel>
    <title>Example</title>
    <link>https://example.com</link>
    <description>Example feed</description>
    <item>
      <guid>item-1</guid>
      <title>First</title>
      <link>https://example.com/1</link>
      <description>One</description>
      <category>rust</category>
    </item>
    <item>
      <guid>item-2</guid>
      <title>Second</title>
      <link>https://example.com/2</link>
    </item>
  </channel>
</rss>"#;

    #[test]
    fn test_parse_items() {
        let items = parse_items(RSS.as_bytes()).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].guid.as_deref(), Some("item-1"));
        assert_eq!(items[0].title.as_deref(), Some("First"));
        assert_eq!(items[0].link.as_deref(), Some("https://example.com/1"));
        assert_eq!(items[0].extra.get("categories").map(String::as_str), Some("rust"));
    }

    #[test]
    fn test_parse_garbage_is_parse_error() {
        let err = parse_items(b"<html><body>nope</body></html>").unwrap_err();
        assert!(matches!(err, FetchError::Parse(_)));
        assert!(!err.is_recoverable());
        assert!(err.to_string().starts_with("Not a valid feed"));
    }

    #[test]
    fn test_status_recoverability() {
        assert!(FetchError::Status(503).is_recoverable());
        assert!(FetchError::Status(429).is_recoverable());
        assert!(!FetchError::Status(404).is_recoverable());
        assert_eq!(FetchError::Status(404).to_string(), "Bad status code (404)");
    }
}
