//! Proxy data models

use crate::proxy::geo::GeoLocation;
use crate::Error;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Proxy type enumeration
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum ProxyType {
    #[default]
    Http,
    Https,
    Socks4,
    Socks5,
}

impl ProxyType {
    pub const ALL: [ProxyType; 4] = [
        ProxyType::Http,
        ProxyType::Https,
        ProxyType::Socks4,
        ProxyType::Socks5,
    ];

    /// Schemes a consumer can request through a proxy of this type
    pub fn schemes(&self) -> &'static [Scheme] {
        match self {
            ProxyType::Http => &[Scheme::Http],
            ProxyType::Https => &[Scheme::Https],
            ProxyType::Socks4 | ProxyType::Socks5 => &[Scheme::Http, Scheme::Https],
        }
    }
}

impl fmt::Display for ProxyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyType::Http => write!(f, "http"),
            ProxyType::Https => write!(f, "https"),
            ProxyType::Socks4 => write!(f, "socks4"),
            ProxyType::Socks5 => write!(f, "socks5"),
        }
    }
}

impl FromStr for ProxyType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "http" => Ok(ProxyType::Http),
            "https" | "connect:443" => Ok(ProxyType::Https),
            "socks4" | "socks4a" => Ok(ProxyType::Socks4),
            "socks5" | "socks5h" => Ok(ProxyType::Socks5),
            _ => Err(Error::config(format!(
                "Invalid proxy type: {}. Use: http, https, socks4, socks5",
                s
            ))),
        }
    }
}

/// Scheme of the request a consumer wants to send through a proxy
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    #[default]
    Http,
    Https,
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::Http => write!(f, "http"),
            Scheme::Https => write!(f, "https"),
        }
    }
}

impl FromStr for Scheme {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "http" => Ok(Scheme::Http),
            "https" => Ok(Scheme::Https),
            _ => Err(Error::config(format!("Invalid scheme: {}", s))),
        }
    }
}

/// How much of the original caller a proxy reveals, ordered from worst to best
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Anonymity {
    Transparent,
    Anonymous,
    High,
}

impl fmt::Display for Anonymity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Anonymity::Transparent => write!(f, "Transparent"),
            Anonymity::Anonymous => write!(f, "Anonymous"),
            Anonymity::High => write!(f, "High"),
        }
    }
}

impl FromStr for Anonymity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "transparent" => Ok(Anonymity::Transparent),
            "anonymous" => Ok(Anonymity::Anonymous),
            "high" | "elite" => Ok(Anonymity::High),
            _ => Err(Error::config(format!(
                "Invalid anonymity level: {}. Use: transparent, anonymous, high",
                s
            ))),
        }
    }
}

/// Unverified address pulled from a provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub host: String,
    pub port: u16,
    /// Types the provider claims the proxy speaks, empty when unknown
    pub types: Vec<ProxyType>,
    pub geo: Option<GeoLocation>,
}

impl Candidate {
    pub fn new(host: String, port: u16) -> Self {
        Self {
            host,
            port,
            types: Vec::new(),
            geo: None,
        }
    }

    pub fn with_types(mut self, types: Vec<ProxyType>) -> Self {
        self.types = types;
        self
    }

    /// Identity used for deduplication
    pub fn key(&self) -> (String, u16) {
        (self.host.clone(), self.port)
    }

    /// Get the candidate string in IP:PORT format
    pub fn to_simple_string(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_simple_string())
    }
}

/// A requested proxy type together with the acceptable anonymity levels.
///
/// An empty `levels` list accepts any level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeFilter {
    pub proxy_type: ProxyType,
    #[serde(default)]
    pub levels: Vec<Anonymity>,
}

impl TypeFilter {
    pub fn new(proxy_type: ProxyType) -> Self {
        Self {
            proxy_type,
            levels: Vec::new(),
        }
    }

    pub fn with_levels(mut self, levels: Vec<Anonymity>) -> Self {
        self.levels = levels;
        self
    }

    /// Whether the proxy passed verification for this type at an accepted level
    pub fn matches(&self, proxy: &Proxy) -> bool {
        match proxy.types.get(&self.proxy_type) {
            Some(level) => self.levels.is_empty() || self.levels.contains(level),
            None => false,
        }
    }

    /// Check a whole filter list: every entry when strict, at least one otherwise
    pub fn matches_all(filters: &[TypeFilter], strict: bool, proxy: &Proxy) -> bool {
        if filters.is_empty() {
            return true;
        }
        if strict {
            filters.iter().all(|f| f.matches(proxy))
        } else {
            filters.iter().any(|f| f.matches(proxy))
        }
    }
}

/// Parses `http`, `http:high` or `http:anonymous,high`
impl FromStr for TypeFilter {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (proxy_type, levels) = match s.split_once(':') {
            Some((t, l)) => (t, Some(l)),
            None => (s, None),
        };
        let levels = levels
            .map(|l| {
                l.split(',')
                    .filter(|p| !p.trim().is_empty())
                    .map(Anonymity::from_str)
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()?
            .unwrap_or_default();

        Ok(TypeFilter::new(proxy_type.parse()?).with_levels(levels))
    }
}

/// A verified proxy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proxy {
    pub host: String,
    pub port: u16,
    /// Types that passed verification with their anonymity level
    pub types: BTreeMap<ProxyType, Anonymity>,
    pub geo: GeoLocation,
    /// Consecutive failures reported by consumers
    pub fails: u32,
    /// Verification rounds this proxy went through
    pub checks: u32,
    /// Requests reported by consumers
    pub requests: u32,
    /// Failed requests reported by consumers
    pub errors: u32,
    pub checked_at: Option<DateTime<Utc>>,
    resp_time_total: Duration,
    resp_samples: u32,
}

impl Proxy {
    /// Create an unverified proxy record; it is not exposed until a type is added
    pub fn new(host: String, port: u16) -> Self {
        Self {
            host,
            port,
            types: BTreeMap::new(),
            geo: GeoLocation::default(),
            fails: 0,
            checks: 0,
            requests: 0,
            errors: 0,
            checked_at: None,
            resp_time_total: Duration::ZERO,
            resp_samples: 0,
        }
    }

    pub fn key(&self) -> (String, u16) {
        (self.host.clone(), self.port)
    }

    pub fn is_verified(&self) -> bool {
        !self.types.is_empty()
    }

    /// Consumer schemes reachable through the verified types
    pub fn schemes(&self) -> BTreeSet<Scheme> {
        self.types
            .keys()
            .flat_map(|t| t.schemes().iter().copied())
            .collect()
    }

    pub fn supports(&self, scheme: Scheme) -> bool {
        self.types.keys().any(|t| t.schemes().contains(&scheme))
    }

    pub fn anonymity(&self, proxy_type: ProxyType) -> Option<Anonymity> {
        self.types.get(&proxy_type).copied()
    }

    pub fn country_code(&self) -> Option<&str> {
        self.geo.country_code.as_deref()
    }

    pub fn avg_resp_time(&self) -> Option<Duration> {
        if self.resp_samples == 0 {
            None
        } else {
            Some(self.resp_time_total / self.resp_samples)
        }
    }

    pub fn record_resp_time(&mut self, elapsed: Duration) {
        self.resp_time_total += elapsed;
        self.resp_samples += 1;
    }

    pub fn error_rate(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.errors as f64 / self.requests as f64
        }
    }

    pub fn record_success(&mut self) {
        self.requests += 1;
        self.fails = 0;
    }

    pub fn record_failure(&mut self) {
        self.requests += 1;
        self.errors += 1;
        self.fails += 1;
    }

    /// Get the proxy URL string for the given type
    pub fn url(&self, proxy_type: ProxyType) -> String {
        proxy_url(&self.host, self.port, proxy_type)
    }

    /// Get the proxy string in IP:PORT format
    pub fn to_simple_string(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let types: Vec<String> = self
            .types
            .iter()
            .map(|(t, level)| format!("{}: {}", t.to_string().to_uppercase(), level))
            .collect();
        let resp = self
            .avg_resp_time()
            .map_or_else(|| "-".to_string(), |d| format!("{:.2}s", d.as_secs_f64()));

        write!(
            f,
            "<Proxy {} {} [{}] {}>",
            self.country_code().unwrap_or("--"),
            resp,
            types.join(", "),
            self.to_simple_string()
        )
    }
}

/// Build a proxy URL usable by an HTTP client
pub fn proxy_url(host: &str, port: u16, proxy_type: ProxyType) -> String {
    let scheme = match proxy_type {
        // HTTPS proxies are still reached over plain HTTP and tunnel with CONNECT
        ProxyType::Http | ProxyType::Https => "http",
        ProxyType::Socks4 => "socks4",
        ProxyType::Socks5 => "socks5",
    };
    format!("{}://{}:{}", scheme, host, port)
}

/// Why a single probe through a candidate did not pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProbeStatus {
    Failed(String),
    Timeout,
}

/// Verdict of the checker for one candidate
#[derive(Debug, Clone)]
pub enum CheckOutcome {
    Accepted(Proxy),
    Rejected { candidate: Candidate, reason: String },
}

impl CheckOutcome {
    pub fn rejected(candidate: Candidate, reason: impl Into<String>) -> Self {
        CheckOutcome::Rejected {
            candidate,
            reason: reason.into(),
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, CheckOutcome::Accepted(_))
    }

    pub fn into_proxy(self) -> Option<Proxy> {
        match self {
            CheckOutcome::Accepted(proxy) => Some(proxy),
            CheckOutcome::Rejected { .. } => None,
        }
    }
}
