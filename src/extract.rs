//! Link extraction
//!
//! Some hosts hand out landing pages instead of files. An extractor whose
//! pattern matches a link turns it into a direct URL before the link is
//! given to the HTTP adapter.

use crate::error::{MirrorError, NetworkErrorKind, Result};
use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use std::sync::Arc;

#[async_trait]
pub trait LinkExtractor: Send + Sync {
    fn name(&self) -> &str;

    fn matches(&self, url: &str) -> bool;

    /// Resolve `url` to a direct download link
    async fn extract(&self, url: &str) -> Result<String>;
}

/// Rewrites matching links with a regex replacement
pub struct RewriteExtractor {
    name: String,
    pattern: Regex,
    replacement: String,
}

impl RewriteExtractor {
    pub fn new(
        name: impl Into<String>,
        pattern: &str,
        replacement: impl Into<String>,
    ) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            pattern: Regex::new(pattern)
                .map_err(|e| MirrorError::invalid_input("pattern", e.to_string()))?,
            replacement: replacement.into(),
        })
    }
}

#[async_trait]
impl LinkExtractor for RewriteExtractor {
    fn name(&self) -> &str {
        &self.name
    }

    fn matches(&self, url: &str) -> bool {
        self.pattern.is_match(url)
    }

    async fn extract(&self, url: &str) -> Result<String> {
        Ok(self
            .pattern
            .replace(url, self.replacement.as_str())
            .into_owned())
    }
}

/// Follows redirects (link shorteners) and returns the final URL
pub struct RedirectExtractor {
    name: String,
    pattern: Regex,
    client: Client,
}

impl RedirectExtractor {
    pub fn new(name: impl Into<String>, pattern: &str) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            pattern: Regex::new(pattern)
                .map_err(|e| MirrorError::invalid_input("pattern", e.to_string()))?,
            client: Client::builder()
                .redirect(reqwest::redirect::Policy::limited(10))
                .build()?,
        })
    }
}

#[async_trait]
impl LinkExtractor for RedirectExtractor {
    fn name(&self) -> &str {
        &self.name
    }

    fn matches(&self, url: &str) -> bool {
        self.pattern.is_match(url)
    }

    async fn extract(&self, url: &str) -> Result<String> {
        let response = self.client.head(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(MirrorError::network(
                NetworkErrorKind::HttpStatus(status.as_u16()),
                format!("{} could not resolve {}: {}", self.name, url, status),
            ));
        }
        Ok(response.url().to_string())
    }
}

/// Ordered set of extractors; the first match wins
#[derive(Default, Clone)]
pub struct ExtractorRegistry {
    extractors: Vec<Arc<dyn LinkExtractor>>,
}

impl ExtractorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in rewrites
    pub fn with_defaults() -> Result<Self> {
        let mut registry = Self::new();
        registry.register(Arc::new(RewriteExtractor::new(
            "dropbox",
            r"^(https?://(?:www\.)?dropbox\.com/.*[?&]dl=)0",
            "${1}1",
        )?));
        registry.register(Arc::new(RewriteExtractor::new(
            "github-blob",
            r"^https?://github\.com/([^/]+)/([^/]+)/blob/(.+)$",
            "https://raw.githubusercontent.com/${1}/${2}/${3}",
        )?));
        Ok(registry)
    }

    pub fn register(&mut self, extractor: Arc<dyn LinkExtractor>) {
        self.extractors.push(extractor);
    }

    pub fn len(&self) -> usize {
        self.extractors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extractors.is_empty()
    }

    /// Direct link for `url`; unmatched links are returned unchanged
    pub async fn resolve(&self, url: &str) -> Result<String> {
        match self.extractors.iter().find(|e| e.matches(url)) {
            Some(extractor) => {
                let direct = extractor.extract(url).await?;
                tracing::debug!("{} resolved {} to {}", extractor.name(), url, direct);
                Ok(direct)
            }
            None => Ok(url.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_default_rewrites() {
        let registry = ExtractorRegistry::with_defaults().unwrap();
        assert_eq!(
            registry
                .resolve("https://www.dropbox.com/s/abc/file.zip?dl=0")
                .await
                .unwrap(),
            "https://www.dropbox.com/s/abc/file.zip?dl=1"
        );
        assert_eq!(
            registry
                .resolve("https://github.com/owner/repo/blob/main/a.txt")
                .await
                .unwrap(),
            "https://raw.githubusercontent.com/owner/repo/main/a.txt"
        );
        assert_eq!(
            registry.resolve("https://example.com/a.zip").await.unwrap(),
            "https://example.com/a.zip"
        );
    }
}
