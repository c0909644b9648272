//! Remote source fetching for library and URL-imported components.

use async_trait::async_trait;
use reqwest::Url;
use std::time::Duration;
use tracing::debug;

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};

const USER_AGENT: &str = concat!("canvas-compiler/", env!("CARGO_PKG_VERSION"));
const FETCH_TIMEOUT_SECS: u64 = 15;

#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<String>;
}

/// HTTPS fetcher restricted to an allow-list of CDN hosts.
pub struct HttpFetcher {
    client: reqwest::Client,
    allowed_domains: Vec<String>,
}

impl HttpFetcher {
    pub fn new(config: &PipelineConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(FETCH_TIMEOUT_SECS))
            .build()
            .map_err(|e| PipelineError::Config(format!("http client: {}", e)))?;
        Ok(Self {
            client,
            allowed_domains: config.allowed_import_domains.clone(),
        })
    }

    /// Parse `url` and check it against the allow-list.
    pub fn check_url(&self, url: &str) -> Result<Url> {
        let reject = |reason: &str| PipelineError::Fetch {
            url: url.to_string(),
            reason: reason.to_string(),
        };
        let parsed = Url::parse(url).map_err(|e| reject(&e.to_string()))?;
        if parsed.scheme() != "https" {
            return Err(reject("only https URLs may be imported"));
        }
        let host = parsed.host_str().ok_or_else(|| reject("URL has no host"))?;
        let allowed = self
            .allowed_domains
            .iter()
            .any(|d| host == d.as_str() || host.ends_with(&format!(".{}", d)));
        if !allowed {
            return Err(reject(&format!("host {} is not an allowed import domain", host)));
        }
        Ok(parsed)
    }
}

#[async_trait]
impl SourceFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<String> {
        let parsed = self.check_url(url)?;
        let fail = |reason: String| PipelineError::Fetch {
            url: url.to_string(),
            reason,
        };
        debug!(url = %parsed, "fetching component source");
        let response = self
            .client
            .get(parsed)
            .send()
            .await
            .map_err(|e| fail(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(fail(format!("HTTP {}", status)));
        }
        response.text().await.map_err(|e| fail(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allow_list() {
        let fetcher = HttpFetcher::new(&PipelineConfig::default()).unwrap();
        assert!(fetcher.check_url("https://esm.sh/some-widget").is_ok());
        assert!(fetcher.check_url("https://cdn.jsdelivr.net/npm/x/index.js").is_ok());
        assert!(fetcher.check_url("https://sub.unpkg.com/x").is_ok());

        let err = fetcher.check_url("https://evil.example.com/x.js").unwrap_err();
        assert!(matches!(err, PipelineError::Fetch { .. }));
        assert!(fetcher.check_url("http://esm.sh/x").is_err());
        assert!(fetcher.check_url("not a url").is_err());
        assert!(fetcher.check_url("https://notesm.sh/x").is_err());
    }
}
