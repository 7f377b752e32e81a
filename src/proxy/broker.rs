//! Broker: discovery and verification pipeline
//!
//! Candidates flow from every provider into a single dispatcher that drops
//! duplicates and spawns one check per unique candidate. At most `max_conn`
//! checks run at once; further candidates wait in the channel. Hosts are
//! deduplicated again by resolved address. Accepted proxies passing the query filters are pushed
//! onto the output queue the pool reads from.

use crate::config::secs;
use crate::proxy::checker::{Checker, CheckerConfig};
use crate::proxy::geo::GeoLookup;
use crate::proxy::judge::{default_judges, HttpJudge, Judge};
use crate::proxy::models::{Candidate, CheckOutcome, Proxy, ProxyType, TypeFilter};
use crate::proxy::provider::{default_sources, Provider, ProviderConfig, ProviderSource, UrlProvider};
use crate::{Error, Result};
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, OnceCell};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Candidates buffered between the provider fetches and the dispatcher
const CANDIDATE_BUFFER: usize = 1024;

/// Configuration for the broker, fixed for its lifetime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Timeout for each probe
    #[serde(with = "secs")]
    pub timeout: Duration,
    /// Checks in flight at once
    pub max_conn: usize,
    /// Attempts per proxy type
    pub max_tries: u32,
    pub verify_ssl: bool,
    /// Judge URLs
    pub judges: Vec<String>,
    pub providers: Vec<ProviderSource>,
    #[serde(with = "secs")]
    pub provider_timeout: Duration,
    /// Provider fetches in flight at once
    pub max_provider_conn: usize,
    /// Pause between provider rounds when serving
    #[serde(with = "secs")]
    pub grab_pause: Duration,
    #[serde(with = "secs")]
    pub backoff: Duration,
    /// Our external address, discovered from the judges when unset
    pub real_ip: Option<IpAddr>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        let checker = CheckerConfig::default();
        Self {
            timeout: checker.timeout,
            max_conn: checker.max_conn,
            max_tries: checker.max_tries,
            verify_ssl: false,
            judges: default_judges(),
            providers: default_sources(),
            provider_timeout: Duration::from_secs(30),
            max_provider_conn: 8,
            grab_pause: Duration::from_secs(180),
            backoff: checker.backoff,
            real_ip: None,
        }
    }
}

impl BrokerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_conn(mut self, max_conn: usize) -> Self {
        self.max_conn = max_conn;
        self
    }

    pub fn with_max_tries(mut self, max_tries: u32) -> Self {
        self.max_tries = max_tries;
        self
    }

    pub fn with_verify_ssl(mut self, verify_ssl: bool) -> Self {
        self.verify_ssl = verify_ssl;
        self
    }

    pub fn with_judges(mut self, judges: Vec<String>) -> Self {
        self.judges = judges;
        self
    }

    pub fn with_providers(mut self, providers: Vec<ProviderSource>) -> Self {
        self.providers = providers;
        self
    }

    pub fn with_provider_timeout(mut self, provider_timeout: Duration) -> Self {
        self.provider_timeout = provider_timeout;
        self
    }

    pub fn with_max_provider_conn(mut self, max_provider_conn: usize) -> Self {
        self.max_provider_conn = max_provider_conn;
        self
    }

    pub fn with_grab_pause(mut self, grab_pause: Duration) -> Self {
        self.grab_pause = grab_pause;
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_real_ip(mut self, real_ip: IpAddr) -> Self {
        self.real_ip = Some(real_ip);
        self
    }

    pub fn checker_config(&self) -> CheckerConfig {
        let mut config = CheckerConfig::new()
            .with_timeout(self.timeout)
            .with_max_conn(self.max_conn)
            .with_max_tries(self.max_tries)
            .with_backoff(self.backoff);
        config.real_ip = self.real_ip;
        config
    }

    pub fn provider_config(&self) -> ProviderConfig {
        ProviderConfig::new()
            .with_timeout(self.provider_timeout)
            .with_verify_ssl(self.verify_ssl)
    }
}

/// What a run is looking for
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindQuery {
    /// Requested types and levels, any verified type when empty
    pub types: Vec<TypeFilter>,
    /// ISO country codes, any country when empty
    pub countries: Vec<String>,
    /// Require every entry of `types` instead of at least one
    pub strict: bool,
    /// Stop after pushing this many proxies, 0 for no limit
    pub limit: usize,
}

impl FindQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_types(mut self, types: Vec<TypeFilter>) -> Self {
        self.types = types;
        self
    }

    pub fn with_countries(mut self, countries: Vec<String>) -> Self {
        self.countries = countries;
        self
    }

    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Types the checker should probe
    fn requested_types(&self) -> Vec<ProxyType> {
        let mut types: Vec<ProxyType> = self.types.iter().map(|f| f.proxy_type).collect();
        types.sort();
        types.dedup();
        types
    }

    pub fn accepts(&self, proxy: &Proxy) -> bool {
        proxy.geo.in_countries(&self.countries)
            && TypeFilter::matches_all(&self.types, self.strict, proxy)
    }

    fn limit_reached(&self, pushed: usize) -> bool {
        self.limit > 0 && pushed >= self.limit
    }
}

/// Counters of one run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    /// Candidates received from providers, duplicates included
    pub received: usize,
    pub unique: usize,
    /// Candidates with a verification verdict
    pub checked: usize,
    /// Proxies pushed onto the queue
    pub accepted: usize,
    /// Candidates failing verification
    pub rejected: usize,
    /// Candidates or proxies dropped by the country or type filters
    pub filtered: usize,
}

impl fmt::Display for RunStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "received {}, unique {}, checked {}, accepted {}, rejected {}, filtered {}",
            self.received, self.unique, self.checked, self.accepted, self.rejected, self.filtered
        )
    }
}

/// Why a provider round ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RoundEnd {
    Exhausted,
    LimitReached,
    Cancelled,
    QueueClosed,
}

/// Result of one spawned check
enum Verdict {
    /// Outside the requested countries, never probed
    Filtered(Candidate),
    /// Resolves to an address already checked in this run
    Duplicate(Candidate),
    Checked(CheckOutcome),
}

/// Candidates already taken in a run, by announced host and by address
#[derive(Default)]
struct Seen {
    hosts: HashSet<(String, u16)>,
    addrs: Arc<Mutex<HashSet<(IpAddr, u16)>>>,
}

/// Discovers, verifies and queues proxies
pub struct Broker {
    config: BrokerConfig,
    queue: Mutex<Option<mpsc::Sender<Proxy>>>,
    providers: Vec<Arc<dyn Provider>>,
    judges: Vec<Arc<dyn Judge>>,
    geo: Option<Arc<dyn GeoLookup>>,
    checker: OnceCell<Arc<Checker>>,
    cancel: CancellationToken,
}

impl Broker {
    /// Create a broker pushing onto `queue`, with judges and providers taken
    /// from the configured URLs
    pub fn new(queue: mpsc::Sender<Proxy>, config: BrokerConfig) -> Result<Self> {
        let judges = config
            .judges
            .iter()
            .map(|url| Ok(Arc::new(HttpJudge::new(url, config.verify_ssl)?) as Arc<dyn Judge>))
            .collect::<Result<Vec<_>>>()?;

        let provider_config = config.provider_config();
        let providers = config
            .providers
            .iter()
            .map(|source| {
                let provider = UrlProvider::with_config(source.clone(), provider_config.clone())?;
                Ok(Arc::new(provider) as Arc<dyn Provider>)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            config,
            queue: Mutex::new(Some(queue)),
            providers,
            judges,
            geo: None,
            checker: OnceCell::new(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_providers(mut self, providers: Vec<Arc<dyn Provider>>) -> Self {
        self.providers = providers;
        self
    }

    pub fn with_judges(mut self, judges: Vec<Arc<dyn Judge>>) -> Self {
        self.judges = judges;
        self
    }

    pub fn with_geo(mut self, geo: Arc<dyn GeoLookup>) -> Self {
        self.geo = Some(geo);
        self
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.queue.lock().is_none()
    }

    /// Find proxies matching `query` and close the queue.
    ///
    /// Returns once `limit` proxies were pushed or every provider is
    /// exhausted and every check finished. Checks still running at the limit
    /// are abandoned.
    pub async fn find(&self, query: FindQuery) -> Result<RunStats> {
        let checker = self.start().await?;
        let queue = self.sender()?;

        let mut seen = Seen::default();
        let mut stats = RunStats::default();
        let end = self
            .run_round(&checker, &queue, &query, &mut seen, &mut stats)
            .await;

        info!("Find finished ({:?}): {}", end, stats);
        drop(queue);
        self.stop();
        Ok(stats)
    }

    /// Keep discovering proxies until [`Broker::shutdown`], then close the queue.
    ///
    /// Providers are fetched again every `grab_pause`; candidates seen in an
    /// earlier round are not checked again. A non-zero `limit` caps the
    /// number of proxies pushed over the whole run.
    pub async fn serve(&self, query: FindQuery) -> Result<RunStats> {
        let checker = self.start().await?;
        let queue = self.sender()?;

        let mut seen = Seen::default();
        let mut stats = RunStats::default();
        let mut round = 0;
        loop {
            round += 1;
            let end = self
                .run_round(&checker, &queue, &query, &mut seen, &mut stats)
                .await;
            info!("Round {} finished ({:?}): {}", round, end, stats);
            if end != RoundEnd::Exhausted {
                break;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.grab_pause) => {}
            }
        }

        drop(queue);
        self.stop();
        Ok(stats)
    }

    /// Collect up to `limit` unique candidates from the requested countries
    /// without checking them. Nothing is pushed onto the queue.
    pub async fn grab(&self, countries: &[String], limit: usize) -> Result<Vec<Candidate>> {
        let resolver = Checker::new(self.config.checker_config(), Vec::new());
        let (tx, mut candidates) = mpsc::channel(CANDIDATE_BUFFER);
        let fetcher = tokio::spawn(fetch_all(
            self.providers.clone(),
            self.config.provider_timeout,
            self.config.max_provider_conn,
            tx,
        ));

        let mut seen = HashSet::new();
        let mut grabbed = Vec::new();
        loop {
            let received = tokio::select! {
                _ = self.cancel.cancelled() => break,
                received = candidates.recv() => received,
            };
            let Some(candidate) = received else {
                break;
            };
            if !seen.insert(candidate.key()) {
                continue;
            }
            let Some(candidate) = self.locate(&resolver, candidate).await else {
                continue;
            };
            if !candidate_in_countries(&candidate, countries) {
                continue;
            }

            debug!("Grabbed {}", candidate);
            grabbed.push(candidate);
            if limit > 0 && grabbed.len() >= limit {
                break;
            }
        }

        fetcher.abort();
        info!("Grabbed {} candidates", grabbed.len());
        Ok(grabbed)
    }

    /// Probe a verified proxy again; see [`Checker::recheck`]
    pub async fn recheck(&self, proxy: &mut Proxy) -> Result<bool> {
        let checker = self.checker().await?;
        Ok(checker.recheck(proxy).await)
    }

    /// Close the queue; later runs fail with [`Error::Closed`]
    pub fn stop(&self) {
        if self.queue.lock().take().is_some() {
            debug!("Broker queue closed");
        }
    }

    /// Cancel the running `find`, `serve` or `grab`
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Prepare the checker for a run; the queue is closed when that fails
    async fn start(&self) -> Result<Arc<Checker>> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        match self.checker().await {
            Ok(checker) => Ok(checker),
            Err(e) => {
                self.stop();
                Err(e)
            }
        }
    }

    fn sender(&self) -> Result<mpsc::Sender<Proxy>> {
        self.queue.lock().clone().ok_or(Error::Closed)
    }

    /// Checker with calibrated judges, prepared on first use
    async fn checker(&self) -> Result<Arc<Checker>> {
        let checker = self
            .checker
            .get_or_try_init(|| async {
                let mut checker = Checker::new(self.config.checker_config(), self.judges.clone());
                checker.prepare().await?;
                Ok::<_, Error>(Arc::new(checker))
            })
            .await?;
        Ok(Arc::clone(checker))
    }

    /// Resolve a candidate and attach its location
    async fn locate(&self, checker: &Checker, mut candidate: Candidate) -> Option<Candidate> {
        let ip = checker.resolve(&candidate.host).await?;
        if candidate.geo.is_none() {
            candidate.geo = self.geo.as_ref().and_then(|geo| geo.locate(ip));
        }
        candidate.host = ip.to_string();
        Some(candidate)
    }

    async fn run_round(
        &self,
        checker: &Arc<Checker>,
        queue: &mpsc::Sender<Proxy>,
        query: &FindQuery,
        seen: &mut Seen,
        stats: &mut RunStats,
    ) -> RoundEnd {
        if query.limit_reached(stats.accepted) {
            return RoundEnd::LimitReached;
        }

        let (tx, mut candidates) = mpsc::channel(CANDIDATE_BUFFER);
        let fetcher = tokio::spawn(fetch_all(
            self.providers.clone(),
            self.config.provider_timeout,
            self.config.max_provider_conn,
            tx,
        ));

        let max_conn = self.config.max_conn.max(1);
        let requested = Arc::new(query.requested_types());
        let countries = Arc::new(query.countries.clone());
        let mut tasks: JoinSet<Verdict> = JoinSet::new();
        let mut providers_done = false;

        let end = loop {
            if providers_done && tasks.is_empty() {
                break RoundEnd::Exhausted;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break RoundEnd::Cancelled,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    match joined {
                        Ok(verdict) => {
                            if let Some(end) = self.handle_verdict(verdict, queue, query, stats).await {
                                break end;
                            }
                        }
                        Err(e) if e.is_cancelled() => {}
                        Err(e) => warn!("Check task failed: {}", e),
                    }
                }
                // Candidates stay in the channel until a check slot is free
                received = candidates.recv(), if !providers_done && tasks.len() < max_conn => match received {
                    Some(candidate) => {
                        stats.received += 1;
                        if !seen.hosts.insert(candidate.key()) {
                            continue;
                        }
                        stats.unique += 1;

                        let checker = Arc::clone(checker);
                        let addrs = Arc::clone(&seen.addrs);
                        let geo = self.geo.clone();
                        let requested = Arc::clone(&requested);
                        let countries = Arc::clone(&countries);
                        tasks.spawn(async move {
                            check_candidate(&checker, geo.as_deref(), &addrs, candidate, &requested, &countries).await
                        });
                    }
                    None => providers_done = true,
                }
            }
        };

        tasks.abort_all();
        fetcher.abort();
        end
    }

    async fn handle_verdict(
        &self,
        verdict: Verdict,
        queue: &mpsc::Sender<Proxy>,
        query: &FindQuery,
        stats: &mut RunStats,
    ) -> Option<RoundEnd> {
        let outcome = match verdict {
            Verdict::Filtered(candidate) => {
                debug!("{} is outside the requested countries", candidate);
                stats.filtered += 1;
                return None;
            }
            Verdict::Duplicate(candidate) => {
                debug!("{} resolves to an address already checked", candidate);
                stats.unique = stats.unique.saturating_sub(1);
                return None;
            }
            Verdict::Checked(outcome) => outcome,
        };

        stats.checked += 1;
        let proxy = match outcome {
            CheckOutcome::Accepted(proxy) => proxy,
            CheckOutcome::Rejected { candidate, reason } => {
                debug!("{} rejected: {}", candidate, reason);
                stats.rejected += 1;
                return None;
            }
        };

        if !query.accepts(&proxy) {
            debug!("{} does not match the query", proxy);
            stats.filtered += 1;
            return None;
        }

        let found = proxy.to_string();
        tokio::select! {
            _ = self.cancel.cancelled() => return Some(RoundEnd::Cancelled),
            sent = queue.send(proxy) => {
                if sent.is_err() {
                    warn!("Proxy queue receiver dropped");
                    return Some(RoundEnd::QueueClosed);
                }
            }
        }
        info!("Found {}", found);
        stats.accepted += 1;

        if query.limit_reached(stats.accepted) {
            Some(RoundEnd::LimitReached)
        } else {
            None
        }
    }
}

fn candidate_in_countries(candidate: &Candidate, countries: &[String]) -> bool {
    countries.is_empty()
        || candidate
            .geo
            .as_ref()
            .is_some_and(|geo| geo.in_countries(countries))
}

/// Resolve, skip known addresses, locate, pre-filter by country, then verify
async fn check_candidate(
    checker: &Checker,
    geo: Option<&dyn GeoLookup>,
    addrs: &Mutex<HashSet<(IpAddr, u16)>>,
    mut candidate: Candidate,
    requested: &[ProxyType],
    countries: &[String],
) -> Verdict {
    let Some(ip) = checker.resolve(&candidate.host).await else {
        return Verdict::Checked(CheckOutcome::rejected(candidate, "unresolvable host"));
    };
    if !addrs.lock().insert((ip, candidate.port)) {
        return Verdict::Duplicate(candidate);
    }
    if candidate.geo.is_none() {
        candidate.geo = geo.and_then(|geo| geo.locate(ip));
    }
    if !candidate_in_countries(&candidate, countries) {
        return Verdict::Filtered(candidate);
    }

    candidate.host = ip.to_string();
    Verdict::Checked(checker.verify(candidate, requested).await)
}

/// Fetch every provider, `max_conn` at a time, and forward their candidates.
/// A failing or slow provider only loses its own candidates.
async fn fetch_all(
    providers: Vec<Arc<dyn Provider>>,
    timeout: Duration,
    max_conn: usize,
    tx: mpsc::Sender<Candidate>,
) {
    let fetches: Vec<_> = providers
        .into_iter()
        .map(|provider| {
            async move {
                let result = tokio::time::timeout(timeout, provider.fetch()).await;
                (provider, result)
            }
            .boxed()
        })
        .collect();
    let mut fetches = stream::iter(fetches).buffer_unordered(max_conn.max(1));

    while let Some((provider, result)) = fetches.next().await {
        match result {
            Ok(Ok(candidates)) => {
                info!("{} candidates from {}", candidates.len(), provider.name());
                for candidate in candidates {
                    if tx.send(candidate).await.is_err() {
                        return;
                    }
                }
            }
            Ok(Err(e)) => warn!("Provider {} failed: {}", provider.name(), e),
            Err(_) => warn!("Provider {} timed out after {:?}", provider.name(), timeout),
        }
    }
}
