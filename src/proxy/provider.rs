//! Providers of candidate proxies
//!
//! A provider is anything that yields a finite list of `host:port` candidates:
//! - [`UrlProvider`] downloads a page or a raw list and parses it
//! - [`StaticProvider`] serves a list supplied by the user
//!
//! Provider-specific scraping quirks stay behind the [`Provider`] trait, the
//! broker only sees candidates.

use crate::proxy::models::{Candidate, ProxyType};
use crate::proxy::parser::CandidateParser;
use crate::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default timeout for HTTP requests in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Default user agent for HTTP requests
const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

/// Source of candidate proxies
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    /// Fetch the current candidate list, possibly with duplicates
    async fn fetch(&self) -> Result<Vec<Candidate>>;
}

/// Configuration for URL providers
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Timeout for HTTP requests
    pub timeout: Duration,
    /// User agent for HTTP requests
    pub user_agent: String,
    pub verify_ssl: bool,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            verify_ssl: false,
        }
    }
}

impl ProviderConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_user_agent(mut self, user_agent: String) -> Self {
        self.user_agent = user_agent;
        self
    }

    pub fn with_verify_ssl(mut self, verify_ssl: bool) -> Self {
        self.verify_ssl = verify_ssl;
        self
    }
}

/// Website or raw list that publishes proxies
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSource {
    pub name: String,
    pub url: String,
    /// Types every proxy of this source is expected to speak
    #[serde(default)]
    pub types: Vec<ProxyType>,
}

impl ProviderSource {
    pub fn new(name: &str, url: &str, types: Vec<ProxyType>) -> Self {
        Self {
            name: name.to_string(),
            url: url.to_string(),
            types,
        }
    }

    /// Source named after the host of its URL
    pub fn from_url(url: &str) -> Self {
        let name = url
            .split("://")
            .nth(1)
            .and_then(|rest| rest.split('/').next())
            .filter(|host| !host.is_empty())
            .unwrap_or(url);
        Self::new(name, url, Vec::new())
    }
}

/// Provider downloading a proxy list over HTTP
pub struct UrlProvider {
    source: ProviderSource,
    client: Client,
}

impl UrlProvider {
    pub fn new(source: ProviderSource) -> Result<Self> {
        Self::with_config(source, ProviderConfig::default())
    }

    pub fn with_config(source: ProviderSource, config: ProviderConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .danger_accept_invalid_certs(!config.verify_ssl)
            .build()?;

        Ok(Self { source, client })
    }

    pub fn source(&self) -> &ProviderSource {
        &self.source
    }
}

#[async_trait]
impl Provider for UrlProvider {
    fn name(&self) -> &str {
        &self.source.name
    }

    async fn fetch(&self) -> Result<Vec<Candidate>> {
        let response = self
            .client
            .get(&self.source.url)
            .send()
            .await?
            .error_for_status()?;
        let content = response.text().await?;
        Ok(CandidateParser::parse_text(&content, &self.source.types))
    }
}

/// Provider serving a fixed list, e.g. proxies supplied by the user
#[derive(Debug, Clone)]
pub struct StaticProvider {
    name: String,
    candidates: Vec<Candidate>,
}

impl StaticProvider {
    pub fn new(name: &str, candidates: Vec<Candidate>) -> Self {
        Self {
            name: name.to_string(),
            candidates,
        }
    }

    /// Build from a pasted list in any format the parser understands
    pub fn from_text(name: &str, content: &str, hints: &[ProxyType]) -> Self {
        Self::new(name, CandidateParser::parse_text(content, hints))
    }

    pub fn from_file<P: AsRef<Path>>(path: P, hints: &[ProxyType]) -> Result<Self> {
        let name = path.as_ref().display().to_string();
        let candidates = CandidateParser::parse_file(path, hints)?;
        Ok(Self::new(&name, candidates))
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

#[async_trait]
impl Provider for StaticProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self) -> Result<Vec<Candidate>> {
        Ok(self.candidates.clone())
    }
}

/// Get a list of common free proxy sources
pub fn default_sources() -> Vec<ProviderSource> {
    vec![
        ProviderSource::new(
            "free-proxy-list.net",
            "https://free-proxy-list.net/",
            vec![ProxyType::Http, ProxyType::Https],
        ),
        ProviderSource::new(
            "sslproxies",
            "https://www.sslproxies.org/",
            vec![ProxyType::Https],
        ),
        ProviderSource::new(
            "us-proxy.org",
            "https://www.us-proxy.org/",
            vec![ProxyType::Http, ProxyType::Https],
        ),
        ProviderSource::new(
            "socks-proxy.net",
            "https://www.socks-proxy.net/",
            vec![ProxyType::Socks4, ProxyType::Socks5],
        ),
        ProviderSource::new(
            "proxyscrape/http",
            "https://api.proxyscrape.com/?request=getproxies&proxytype=http",
            vec![ProxyType::Http, ProxyType::Https],
        ),
        ProviderSource::new(
            "proxyscrape/socks5",
            "https://api.proxyscrape.com/?request=getproxies&proxytype=socks5",
            vec![ProxyType::Socks5],
        ),
        ProviderSource::new(
            "TheSpeedX/http",
            "https://raw.githubusercontent.com/TheSpeedX/SOCKS-List/master/http.txt",
            vec![ProxyType::Http, ProxyType::Https],
        ),
        ProviderSource::new(
            "TheSpeedX/socks5",
            "https://raw.githubusercontent.com/TheSpeedX/SOCKS-List/master/socks5.txt",
            vec![ProxyType::Socks5],
        ),
        ProviderSource::new(
            "clarketm",
            "https://raw.githubusercontent.com/clarketm/proxy-list/master/proxy-list-raw.txt",
            Vec::new(),
        ),
        ProviderSource::new(
            "hookzof/socks5",
            "https://raw.githubusercontent.com/hookzof/socks5_list/master/proxy.txt",
            vec![ProxyType::Socks5],
        ),
    ]
}
