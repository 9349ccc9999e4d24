use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// The fingerprint of a forwarded request.
///
/// A key consists of the request method and the normalized request identifier (usually the
/// request URI including its query). Two keys built from identical request shapes compare equal
/// and hash identically. The method is upper-cased on construction, so `get` and `GET` key the
/// same request.
///
/// Cloning is cheap, both parts are reference counted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "RawCacheKey")]
pub struct CacheKey {
    method: Arc<str>,
    uri: Arc<str>,
}

/// A key as written to disk, normalized through [`CacheKey::new`] when read back.
#[derive(Deserialize)]
struct RawCacheKey {
    method: Arc<str>,
    uri: Arc<str>,
}

impl From<RawCacheKey> for CacheKey {
    fn from(raw: RawCacheKey) -> Self {
        Self::new(&*raw.method, raw.uri)
    }
}

impl CacheKey {
    /// Creates the key for a request with the given `method` and `uri`.
    pub fn new(method: impl AsRef<str>, uri: impl Into<Arc<str>>) -> Self {
        Self {
            method: method.as_ref().to_ascii_uppercase().into(),
            uri: uri.into(),
        }
    }

    /// Shorthand for a `GET` request key.
    pub fn get(uri: impl Into<Arc<str>>) -> Self {
        Self::new("GET", uri)
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }
}

/// Formats the key as `METHOD|uri`.
///
/// This is the form handed out to clients alongside cached responses.
impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.method, self.uri)
    }
}
