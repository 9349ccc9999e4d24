//! The payload cached for forwarded requests.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::caching::CacheKey;

/// The header carrying the cache key a response was served for.
pub const CACHE_KEY_HEADER: &str = "X-Cache-Key";

/// The header carrying how often the cached response has been served.
pub const HITS_HEADER: &str = "X-Hits";

/// A complete upstream response as stored in the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl CachedResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    /// A `200 OK` response with the given body.
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self::new(200, body)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Returns the first value of the header `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Returns a copy of this response annotated with the key it is cached under and its hit count.
    ///
    /// Annotations from a previous serve are replaced.
    pub fn served(&self, key: &CacheKey, hits: u64) -> Self {
        let mut response = self.clone();
        response.headers.retain(|(name, _)| {
            !name.eq_ignore_ascii_case(CACHE_KEY_HEADER) && !name.eq_ignore_ascii_case(HITS_HEADER)
        });
        response
            .with_header(CACHE_KEY_HEADER, key.to_string())
            .with_header(HITS_HEADER, hits.to_string())
    }
}
