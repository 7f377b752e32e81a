//! Proxy checker verifying candidates against judges

use crate::proxy::anonymity::classify_against;
use crate::proxy::judge::{Judge, ObservedRequest};
use crate::proxy::models::{Anonymity, Candidate, CheckOutcome, ProbeStatus, Proxy, ProxyType};
use crate::{Error, Result};
use chrono::Utc;
use futures::future::join_all;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Default timeout for each probe in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 8;

/// Default number of concurrent probes
const DEFAULT_MAX_CONN: usize = 200;

/// Default attempts per proxy type
const DEFAULT_MAX_TRIES: u32 = 3;

/// Default delay before the second attempt
const DEFAULT_BACKOFF_MS: u64 = 250;

/// Upper bound of the delay between attempts
const MAX_BACKOFF: Duration = Duration::from_secs(2);

/// Configuration for proxy checker
#[derive(Debug, Clone)]
pub struct CheckerConfig {
    /// Timeout for each probe
    pub timeout: Duration,
    /// Number of probes in flight at once
    pub max_conn: usize,
    /// Attempts per proxy type before it is rejected
    pub max_tries: u32,
    /// Delay before the second attempt, doubled for each further one
    pub backoff: Duration,
    /// Our external address; discovered from the judges when unset
    pub real_ip: Option<IpAddr>,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_conn: DEFAULT_MAX_CONN,
            max_tries: DEFAULT_MAX_TRIES,
            backoff: Duration::from_millis(DEFAULT_BACKOFF_MS),
            real_ip: None,
        }
    }
}

impl CheckerConfig {
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

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_real_ip(mut self, real_ip: IpAddr) -> Self {
        self.real_ip = Some(real_ip);
        self
    }

    /// Delay before attempt number `attempt` (0-based)
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        self.backoff.saturating_mul(factor).min(MAX_BACKOFF)
    }
}

/// Checker verifying candidates through judges
///
/// Probes are gated by a semaphore of `max_conn` permits shared by every
/// check running on this checker.
pub struct Checker {
    config: CheckerConfig,
    judges: Vec<Arc<dyn Judge>>,
    real_ip: Option<IpAddr>,
    /// What each judge reported for a direct request, by judge name
    baselines: HashMap<String, ObservedRequest>,
    probe_gate: Arc<Semaphore>,
}

impl Checker {
    pub fn new(config: CheckerConfig, judges: Vec<Arc<dyn Judge>>) -> Self {
        let probe_gate = Arc::new(Semaphore::new(config.max_conn.max(1)));
        let real_ip = config.real_ip;
        Self {
            config,
            judges,
            real_ip,
            baselines: HashMap::new(),
            probe_gate,
        }
    }

    pub fn config(&self) -> &CheckerConfig {
        &self.config
    }

    pub fn judges(&self) -> &[Arc<dyn Judge>] {
        &self.judges
    }

    pub fn real_ip(&self) -> Option<IpAddr> {
        self.real_ip
    }

    /// Query every judge directly and keep the ones that answer.
    ///
    /// Also learns our external address unless it was configured, and keeps
    /// each judge's direct answer to tell its own headers from the proxy's.
    pub async fn prepare(&mut self) -> Result<()> {
        let timeout = self.config.timeout;
        let results = join_all(self.judges.iter().map(|judge| async move {
            match tokio::time::timeout(timeout, judge.calibrate(timeout)).await {
                Ok(result) => result,
                Err(e) => Err(Error::from(e)),
            }
        }))
        .await;

        let mut working = Vec::new();
        for (judge, result) in self.judges.iter().zip(results) {
            match result {
                Ok(observed) => {
                    if self.real_ip.is_none() {
                        self.real_ip = observed.origin.first().copied();
                    }
                    self.baselines.insert(judge.name().to_string(), observed);
                    working.push(Arc::clone(judge));
                }
                Err(e) => warn!("Judge {} is unavailable: {}", judge.name(), e),
            }
        }

        if working.is_empty() {
            return Err(Error::NoJudges);
        }

        info!(
            "{} of {} judges available, external address {}",
            working.len(),
            self.judges.len(),
            self.real_ip.map_or_else(|| "unknown".to_string(), |ip| ip.to_string())
        );
        self.judges = working;
        Ok(())
    }

    /// Resolve a candidate host to an address
    pub async fn resolve(&self, host: &str) -> Option<IpAddr> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Some(ip);
        }

        match tokio::time::timeout(self.config.timeout, tokio::net::lookup_host((host, 0))).await
        {
            Ok(Ok(addrs)) => {
                let addrs: Vec<IpAddr> = addrs.map(|a| a.ip()).collect();
                addrs
                    .iter()
                    .copied()
                    .find(IpAddr::is_ipv4)
                    .or_else(|| addrs.first().copied())
            }
            Ok(Err(e)) => {
                debug!("Failed to resolve {}: {}", host, e);
                None
            }
            Err(_) => {
                debug!("Timed out resolving {}", host);
                None
            }
        }
    }

    /// Types to probe for a candidate: its hints narrowed to the requested
    /// types, or all requested types when the hints don't overlap them
    pub fn types_to_probe(candidate: &Candidate, requested: &[ProxyType]) -> Vec<ProxyType> {
        let requested: Vec<ProxyType> = if requested.is_empty() {
            ProxyType::ALL.to_vec()
        } else {
            let mut types = requested.to_vec();
            types.sort();
            types.dedup();
            types
        };

        let hinted: Vec<ProxyType> = requested
            .iter()
            .copied()
            .filter(|t| candidate.types.contains(t))
            .collect();

        if hinted.is_empty() {
            requested
        } else {
            hinted
        }
    }

    /// Verify a candidate for the requested types.
    ///
    /// All types are probed concurrently; the verdict is produced once every
    /// one of them resolved. A candidate with no passing type is rejected.
    pub async fn verify(&self, candidate: Candidate, requested: &[ProxyType]) -> CheckOutcome {
        let Some(ip) = self.resolve(&candidate.host).await else {
            return CheckOutcome::rejected(candidate, "unresolvable host");
        };
        let host = ip.to_string();
        let types = Self::types_to_probe(&candidate, requested);

        let results = join_all(
            types
                .iter()
                .map(|proxy_type| self.verify_type(&host, candidate.port, *proxy_type)),
        )
        .await;

        let mut proxy = Proxy::new(host, candidate.port);
        proxy.geo = candidate.geo.clone().unwrap_or_default();
        for (proxy_type, result) in types.iter().zip(results) {
            if let Some((level, elapsed)) = result {
                proxy.types.insert(*proxy_type, level);
                proxy.record_resp_time(elapsed);
            }
        }
        proxy.checks += 1;
        proxy.checked_at = Some(Utc::now());

        if proxy.is_verified() {
            debug!("{} accepted", proxy);
            CheckOutcome::Accepted(proxy)
        } else {
            CheckOutcome::rejected(candidate, "no type passed verification")
        }
    }

    /// Probe the known types of a verified proxy again.
    ///
    /// Types that no longer pass are dropped; returns whether any remain.
    pub async fn recheck(&self, proxy: &mut Proxy) -> bool {
        let types: Vec<ProxyType> = proxy.types.keys().copied().collect();
        let results = join_all(
            types
                .iter()
                .map(|proxy_type| self.verify_type(&proxy.host, proxy.port, *proxy_type)),
        )
        .await;

        for (proxy_type, result) in types.iter().zip(results) {
            match result {
                Some((level, elapsed)) => {
                    proxy.types.insert(*proxy_type, level);
                    proxy.record_resp_time(elapsed);
                }
                None => {
                    proxy.types.remove(proxy_type);
                }
            }
        }
        proxy.checks += 1;
        proxy.checked_at = Some(Utc::now());

        proxy.is_verified()
    }

    /// Try one type up to `max_tries` times
    async fn verify_type(
        &self,
        host: &str,
        port: u16,
        proxy_type: ProxyType,
    ) -> Option<(Anonymity, Duration)> {
        for attempt in 0..self.config.max_tries.max(1) {
            let delay = self.config.backoff_for(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let judge = self.pick_judge(proxy_type)?;
            let status = {
                // The gate is never closed, acquire only fails after close()
                let _permit = self.probe_gate.acquire().await.ok()?;
                let probe = judge.probe(host, port, proxy_type, self.config.timeout);
                match tokio::time::timeout(self.config.timeout, probe).await {
                    Ok(Ok(verdict)) => {
                        let level = classify_against(
                            proxy_type,
                            self.real_ip,
                            &verdict.observed,
                            self.baselines.get(judge.name()),
                        );
                        debug!(
                            "{}:{} {} passed on {} ({}, {:?})",
                            host,
                            port,
                            proxy_type,
                            judge.name(),
                            level,
                            verdict.elapsed
                        );
                        return Some((level, verdict.elapsed));
                    }
                    Ok(Err(e)) if e.is_timeout() => ProbeStatus::Timeout,
                    Ok(Err(e)) => ProbeStatus::Failed(e.to_string()),
                    Err(_) => ProbeStatus::Timeout,
                }
            };

            debug!(
                "{}:{} {} attempt {}/{} on {}: {:?}",
                host,
                port,
                proxy_type,
                attempt + 1,
                self.config.max_tries,
                judge.name(),
                status
            );
        }

        None
    }

    /// Random judge able to verify the type, or any judge when none can
    fn pick_judge(&self, proxy_type: ProxyType) -> Option<Arc<dyn Judge>> {
        let capable: Vec<&Arc<dyn Judge>> = self
            .judges
            .iter()
            .filter(|j| j.supports(proxy_type))
            .collect();

        let mut rng = rand::thread_rng();
        if capable.is_empty() {
            self.judges.choose(&mut rng).cloned()
        } else {
            capable.choose(&mut rng).map(|j| Arc::clone(j))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::judge::{JudgeVerdict, ObservedRequest};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    /// Judge failing `failures` times before answering, optionally slowly
    struct ScriptedJudge {
        failures: u32,
        delay: Duration,
        calls: AtomicU32,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        headers: Vec<(&'static str, &'static str)>,
        /// Headers the judge reports for direct requests too
        own_headers: Vec<(&'static str, &'static str)>,
        calibrates: bool,
    }

    impl ScriptedJudge {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                delay: Duration::ZERO,
                calls: AtomicU32::new(0),
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                headers: Vec::new(),
                own_headers: Vec::new(),
                calibrates: true,
            }
        }
    }

    #[async_trait]
    impl Judge for ScriptedJudge {
        fn name(&self) -> &str {
            "scripted"
        }

        fn supports(&self, proxy_type: ProxyType) -> bool {
            proxy_type == ProxyType::Http
        }

        async fn calibrate(&self, _timeout: Duration) -> Result<ObservedRequest> {
            if self.calibrates {
                let mut observed = ObservedRequest::new().with_origin("203.0.113.7".parse().unwrap());
                for (name, value) in &self.own_headers {
                    observed = observed.with_header(name, value);
                }
                Ok(observed)
            } else {
                Err(Error::probe("down"))
            }
        }

        async fn probe(
            &self,
            _host: &str,
            _port: u16,
            _proxy_type: ProxyType,
            _timeout: Duration,
        ) -> Result<JudgeVerdict> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(Error::probe("connection refused"));
            }
            let mut observed = ObservedRequest::new().with_origin("198.51.100.1".parse().unwrap());
            for (name, value) in self.own_headers.iter().chain(&self.headers) {
                observed = observed.with_header(name, value);
            }
            Ok(JudgeVerdict {
                observed,
                elapsed: Duration::from_millis(40),
            })
        }
    }

    fn fast_config() -> CheckerConfig {
        CheckerConfig::new()
            .with_timeout(Duration::from_millis(200))
            .with_backoff(Duration::from_millis(1))
    }

    fn candidate() -> Candidate {
        Candidate::new("1.2.3.4".to_string(), 8080)
    }

    #[test]
    fn test_checker_config_default() {
        let config = CheckerConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(DEFAULT_TIMEOUT_SECS));
        assert_eq!(config.max_conn, DEFAULT_MAX_CONN);
        assert_eq!(config.max_tries, DEFAULT_MAX_TRIES);
    }

    #[test]
    fn test_backoff_is_bounded() {
        let config = CheckerConfig::new().with_backoff(Duration::from_millis(250));
        assert_eq!(config.backoff_for(0), Duration::ZERO);
        assert_eq!(config.backoff_for(1), Duration::from_millis(250));
        assert_eq!(config.backoff_for(2), Duration::from_millis(500));
        assert_eq!(config.backoff_for(10), MAX_BACKOFF);
        assert_eq!(config.backoff_for(40), MAX_BACKOFF);
    }

    #[test]
    fn test_types_to_probe() {
        let hinted = candidate().with_types(vec![ProxyType::Socks5]);
        assert_eq!(
            Checker::types_to_probe(&hinted, &[ProxyType::Http, ProxyType::Socks5]),
            vec![ProxyType::Socks5]
        );
        assert_eq!(
            Checker::types_to_probe(&hinted, &[ProxyType::Http]),
            vec![ProxyType::Http]
        );
        assert_eq!(Checker::types_to_probe(&candidate(), &[]), ProxyType::ALL.to_vec());
    }

    #[tokio::test]
    async fn test_verify_retries_until_success() {
        let judge = Arc::new(ScriptedJudge::new(2));
        let checker = Checker::new(
            fast_config().with_max_tries(3),
            vec![judge.clone() as Arc<dyn Judge>],
        );

        let outcome = checker.verify(candidate(), &[ProxyType::Http]).await;
        let proxy = outcome.into_proxy().expect("proxy should pass on third try");
        assert_eq!(judge.calls.load(Ordering::SeqCst), 3);
        assert_eq!(proxy.anonymity(ProxyType::Http), Some(Anonymity::High));
        assert_eq!(proxy.checks, 1);
        assert_eq!(proxy.avg_resp_time(), Some(Duration::from_millis(40)));
    }

    #[tokio::test]
    async fn test_verify_rejects_after_max_tries() {
        let judge = Arc::new(ScriptedJudge::new(10));
        let checker = Checker::new(
            fast_config().with_max_tries(2),
            vec![judge.clone() as Arc<dyn Judge>],
        );

        let outcome = checker.verify(candidate(), &[ProxyType::Http]).await;
        assert!(!outcome.is_accepted());
        assert_eq!(judge.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_verify_timeout_is_a_failed_attempt() {
        let mut judge = ScriptedJudge::new(0);
        judge.delay = Duration::from_secs(5);
        let checker = Checker::new(
            fast_config()
                .with_timeout(Duration::from_millis(50))
                .with_max_tries(2),
            vec![Arc::new(judge) as Arc<dyn Judge>],
        );

        let started = std::time::Instant::now();
        let outcome = checker.verify(candidate(), &[ProxyType::Http]).await;
        assert!(!outcome.is_accepted());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_verify_classifies_with_real_ip() {
        let mut judge = ScriptedJudge::new(0);
        judge.headers = vec![("X-Forwarded-For", "203.0.113.7")];
        let checker = Checker::new(
            fast_config().with_real_ip("203.0.113.7".parse().unwrap()),
            vec![Arc::new(judge) as Arc<dyn Judge>],
        );

        let proxy = checker
            .verify(candidate(), &[ProxyType::Http])
            .await
            .into_proxy()
            .unwrap();
        assert_eq!(proxy.anonymity(ProxyType::Http), Some(Anonymity::Transparent));
    }

    #[tokio::test]
    async fn test_judge_headers_seen_at_calibration_are_ignored() {
        let mut judge = ScriptedJudge::new(0);
        judge.own_headers = vec![("Via", "1.1 judge-frontend")];
        let mut checker = Checker::new(fast_config(), vec![Arc::new(judge) as Arc<dyn Judge>]);
        checker.prepare().await.unwrap();

        let proxy = checker
            .verify(candidate(), &[ProxyType::Http])
            .await
            .into_proxy()
            .unwrap();
        assert_eq!(proxy.anonymity(ProxyType::Http), Some(Anonymity::High));

        let mut judge = ScriptedJudge::new(0);
        judge.own_headers = vec![("Via", "1.1 judge-frontend")];
        judge.headers = vec![("Proxy-Connection", "keep-alive")];
        let mut checker = Checker::new(fast_config(), vec![Arc::new(judge) as Arc<dyn Judge>]);
        checker.prepare().await.unwrap();

        let proxy = checker
            .verify(candidate(), &[ProxyType::Http])
            .await
            .into_proxy()
            .unwrap();
        assert_eq!(proxy.anonymity(ProxyType::Http), Some(Anonymity::Anonymous));
    }

    #[tokio::test]
    async fn test_probe_gate_limits_concurrency() {
        let mut judge = ScriptedJudge::new(0);
        judge.delay = Duration::from_millis(20);
        let judge = Arc::new(judge);
        let checker = Arc::new(Checker::new(
            fast_config().with_max_conn(3),
            vec![judge.clone() as Arc<dyn Judge>],
        ));

        let checks = (0..12).map(|i| {
            let checker = Arc::clone(&checker);
            async move {
                checker
                    .verify(
                        Candidate::new(format!("10.0.0.{}", i + 1), 8080),
                        &[ProxyType::Http],
                    )
                    .await
            }
        });
        let outcomes = join_all(checks).await;

        assert!(outcomes.iter().all(CheckOutcome::is_accepted));
        assert!(judge.peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_prepare_drops_dead_judges() {
        let mut dead = ScriptedJudge::new(0);
        dead.calibrates = false;
        let mut checker = Checker::new(
            fast_config(),
            vec![
                Arc::new(dead) as Arc<dyn Judge>,
                Arc::new(ScriptedJudge::new(0)),
            ],
        );

        checker.prepare().await.unwrap();
        assert_eq!(checker.judges().len(), 1);
        assert_eq!(checker.real_ip(), Some("203.0.113.7".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_prepare_without_judges() {
        let mut dead = ScriptedJudge::new(0);
        dead.calibrates = false;
        let mut checker = Checker::new(fast_config(), vec![Arc::new(dead) as Arc<dyn Judge>]);
        assert!(matches!(checker.prepare().await, Err(Error::NoJudges)));
    }

    #[tokio::test]
    async fn test_recheck_drops_failing_types() {
        let judge = Arc::new(ScriptedJudge::new(100));
        let checker = Checker::new(fast_config().with_max_tries(1), vec![judge as Arc<dyn Judge>]);

        let mut proxy = Proxy::new("1.2.3.4".to_string(), 8080);
        proxy.types.insert(ProxyType::Http, Anonymity::High);
        assert!(!checker.recheck(&mut proxy).await);
        assert!(proxy.types.is_empty());
        assert_eq!(proxy.checks, 1);
    }

    #[tokio::test]
    async fn test_resolve_ip_literal() {
        let checker = Checker::new(fast_config(), Vec::new());
        assert_eq!(
            checker.resolve("127.0.0.1").await,
            Some("127.0.0.1".parse().unwrap())
        );
    }
}
