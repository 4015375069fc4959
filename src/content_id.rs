//! The stable key that ties scratch files, final files and reports together.

use std::fmt;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

/// Trailing path segment of a source URL, e.g. `1AbCdEf` for
/// `https://x.com/i/spaces/1AbCdEf`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentId(String);

impl ContentId {
    pub fn new(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            bail!("content identifier is empty");
        }
        if trimmed == "." || trimmed == ".." {
            bail!("content identifier {trimmed:?} is not a valid file name component");
        }
        if trimmed.contains(['/', '\\', '\0']) {
            bail!("content identifier {trimmed:?} contains a path separator");
        }
        Ok(Self(trimmed.to_owned()))
    }

    /// Extracts the identifier from a source URL, ignoring the query string,
    /// the fragment and trailing slashes.
    pub fn from_url(url: &str) -> Result<Self> {
        let without_fragment = url.trim().split('#').next().unwrap_or_default();
        let without_query = without_fragment.split('?').next().unwrap_or_default();
        let segment = without_query
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or_default();
        if segment.is_empty() || segment.ends_with(':') {
            bail!("could not find a content identifier in {url:?}");
        }
        Self::new(segment)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ContentId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
