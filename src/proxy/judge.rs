//! Judges: echo endpoints that report what a request looked like on arrival
//!
//! A judge answers with the client address and request headers it observed.
//! Requesting a judge directly reveals our own external address, requesting
//! it through a candidate shows whether the candidate works and what it
//! forwards about us.

use crate::proxy::models::{proxy_url, ProxyType};
use crate::{Error, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{Client, Proxy as ReqwestProxy};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// `NAME = value` lines of azenv-style judges
static ENV_LINE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^\s*([A-Z][A-Z0-9_]+)\s*=\s*(.*?)\s*$").expect("Invalid env line regex")
});

/// What the judge saw of an incoming request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObservedRequest {
    /// Client addresses as reported by the judge
    pub origin: Vec<IpAddr>,
    /// Header names are lowercase and dash separated
    pub headers: BTreeMap<String, String>,
}

impl ObservedRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_origin(mut self, ip: IpAddr) -> Self {
        self.origin.push(ip);
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(normalize_header(name), value.to_string());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&normalize_header(name)).map(String::as_str)
    }

    /// Parse a judge body: httpbin-style JSON, or azenv-style `NAME = value` lines
    pub fn parse(body: &str) -> Result<Self> {
        let mut observed = ObservedRequest::new();
        if let Ok(echo) = serde_json::from_str::<JsonEcho>(body) {
            observed.origin = extract_ips(&echo.origin);
            for (name, value) in echo.headers {
                observed.headers.insert(normalize_header(&name), value);
            }
        } else {
            for cap in ENV_LINE_REGEX.captures_iter(body) {
                let name = &cap[1];
                let value = &cap[2];
                if name == "REMOTE_ADDR" {
                    observed.origin.extend(extract_ips(value));
                } else if let Some(header) = name.strip_prefix("HTTP_") {
                    observed.headers.insert(normalize_header(header), value.to_string());
                }
            }
        }

        if observed.origin.is_empty() && observed.headers.is_empty() {
            return Err(Error::probe("unrecognized judge response"));
        }
        Ok(observed)
    }
}

#[derive(Deserialize)]
struct JsonEcho {
    #[serde(default)]
    origin: String,
    #[serde(default)]
    headers: BTreeMap<String, String>,
}

/// `X_Forwarded_For` and `x-forwarded-for` name the same header
pub fn normalize_header(name: &str) -> String {
    name.trim().to_lowercase().replace('_', "-")
}

/// Every IP address literal contained in `text`
pub fn extract_ips(text: &str) -> Vec<IpAddr> {
    text.split(|c: char| !(c.is_ascii_hexdigit() || c == '.' || c == ':'))
        .filter_map(|token| token.parse().ok())
        .collect()
}

/// Successful probe through a candidate
#[derive(Debug, Clone)]
pub struct JudgeVerdict {
    pub observed: ObservedRequest,
    pub elapsed: Duration,
}

/// Echo endpoint used to verify candidates
#[async_trait]
pub trait Judge: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this judge can verify the given proxy type
    fn supports(&self, proxy_type: ProxyType) -> bool;

    /// Request the judge directly; the observed origin is our external address
    async fn calibrate(&self, timeout: Duration) -> Result<ObservedRequest>;

    /// Request the judge through `host:port` speaking `proxy_type`
    async fn probe(
        &self,
        host: &str,
        port: u16,
        proxy_type: ProxyType,
        timeout: Duration,
    ) -> Result<JudgeVerdict>;
}

/// Judge reached over HTTP(S), e.g. `http://httpbin.org/get?show_env`
pub struct HttpJudge {
    url: String,
    secure: bool,
    verify_ssl: bool,
}

impl HttpJudge {
    pub fn new(url: &str, verify_ssl: bool) -> Result<Self> {
        let secure = if url.starts_with("https://") {
            true
        } else if url.starts_with("http://") {
            false
        } else {
            return Err(Error::config(format!("Invalid judge URL: {}", url)));
        };

        Ok(Self {
            url: url.to_string(),
            secure,
            verify_ssl,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn client_builder(&self, timeout: Duration) -> reqwest::ClientBuilder {
        Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(!self.verify_ssl)
            .pool_max_idle_per_host(0)
    }

    /// Create a reqwest client routed through the candidate
    fn proxied_client(
        &self,
        host: &str,
        port: u16,
        proxy_type: ProxyType,
        timeout: Duration,
    ) -> Result<Client> {
        let url = proxy_url(host, port, proxy_type);
        let proxy = match proxy_type {
            ProxyType::Http => ReqwestProxy::http(&url)?,
            ProxyType::Https => ReqwestProxy::https(&url)?,
            ProxyType::Socks4 | ProxyType::Socks5 => ReqwestProxy::all(&url)?,
        };
        Ok(self.client_builder(timeout).proxy(proxy).build()?)
    }

    async fn fetch(&self, client: &Client) -> Result<ObservedRequest> {
        let response = client.get(&self.url).send().await?.error_for_status()?;
        let body = response.text().await?;
        ObservedRequest::parse(&body)
    }
}

#[async_trait]
impl Judge for HttpJudge {
    fn name(&self) -> &str {
        &self.url
    }

    fn supports(&self, proxy_type: ProxyType) -> bool {
        match proxy_type {
            ProxyType::Http => !self.secure,
            ProxyType::Https => self.secure,
            // reqwest 0.11 only speaks SOCKS5 to upstream proxies
            ProxyType::Socks4 => false,
            ProxyType::Socks5 => true,
        }
    }

    async fn calibrate(&self, timeout: Duration) -> Result<ObservedRequest> {
        let client = self.client_builder(timeout).no_proxy().build()?;
        let observed = self.fetch(&client).await?;
        if observed.origin.is_empty() {
            return Err(Error::probe(format!("{} did not report an origin", self.url)));
        }
        Ok(observed)
    }

    async fn probe(
        &self,
        host: &str,
        port: u16,
        proxy_type: ProxyType,
        timeout: Duration,
    ) -> Result<JudgeVerdict> {
        let client = self.proxied_client(host, port, proxy_type, timeout)?;
        let start = Instant::now();
        let observed = self.fetch(&client).await?;
        Ok(JudgeVerdict {
            observed,
            elapsed: start.elapsed(),
        })
    }
}

/// Judges used when none are configured
pub fn default_judges() -> Vec<String> {
    vec![
        "http://httpbin.org/get?show_env".to_string(),
        "https://httpbin.org/get?show_env".to_string(),
        "http://azenv.net/".to_string(),
    ]
}
