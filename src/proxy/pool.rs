//! Pool of verified proxies shared by concurrent consumers
//!
//! The pool owns every proxy it hands out: `get` moves a proxy to the
//! checked-out set before returning it and `put` brings it back together with
//! the outcome of its use. A feeder task imports proxies from the broker
//! queue whenever the pool runs low or someone is waiting.

use crate::config::secs;
use crate::proxy::models::{Proxy, Scheme, TypeFilter};
use crate::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::{debug, info};

/// Configuration for the proxy pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// How long `get` waits for a matching proxy
    #[serde(with = "secs")]
    pub wait_timeout: Duration,
    /// Consecutive failures a proxy may accumulate before it is retired
    pub max_fails: u32,
    /// Requests before the error rate and latency limits apply
    pub min_requests: u32,
    pub max_error_rate: f64,
    #[serde(with = "secs")]
    pub max_resp_time: Duration,
    /// Import from the queue while fewer proxies are available
    pub min_available: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            wait_timeout: Duration::from_secs(10),
            max_fails: 3,
            min_requests: 5,
            max_error_rate: 0.5,
            max_resp_time: Duration::from_secs(8),
            min_available: 5,
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_wait_timeout(mut self, wait_timeout: Duration) -> Self {
        self.wait_timeout = wait_timeout;
        self
    }

    pub fn with_max_fails(mut self, max_fails: u32) -> Self {
        self.max_fails = max_fails;
        self
    }

    pub fn with_min_requests(mut self, min_requests: u32) -> Self {
        self.min_requests = min_requests;
        self
    }

    pub fn with_max_error_rate(mut self, max_error_rate: f64) -> Self {
        self.max_error_rate = max_error_rate;
        self
    }

    pub fn with_max_resp_time(mut self, max_resp_time: Duration) -> Self {
        self.max_resp_time = max_resp_time;
        self
    }

    pub fn with_min_available(mut self, min_available: usize) -> Self {
        self.min_available = min_available;
        self
    }

    /// Why a returned proxy should leave the pool for good, if it should
    fn retire_reason(&self, proxy: &Proxy) -> Option<&'static str> {
        if proxy.fails > self.max_fails {
            return Some("too many consecutive failures");
        }
        if proxy.requests >= self.min_requests {
            if proxy.error_rate() > self.max_error_rate {
                return Some("error rate too high");
            }
            if proxy
                .avg_resp_time()
                .is_some_and(|resp| resp > self.max_resp_time)
            {
                return Some("too slow");
            }
        }
        None
    }
}

/// What a consumer needs from a proxy
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProxyFilter {
    pub scheme: Scheme,
    /// ISO country code, any country when unset
    pub country: Option<String>,
    pub types: Vec<TypeFilter>,
    /// Require every entry of `types` instead of at least one
    pub strict: bool,
}

impl ProxyFilter {
    pub fn new(scheme: Scheme) -> Self {
        Self {
            scheme,
            ..Default::default()
        }
    }

    pub fn with_country(mut self, country: &str) -> Self {
        self.country = Some(country.to_string());
        self
    }

    pub fn with_types(mut self, types: Vec<TypeFilter>) -> Self {
        self.types = types;
        self
    }

    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn matches(&self, proxy: &Proxy) -> bool {
        if !proxy.supports(self.scheme) {
            return false;
        }
        if let Some(country) = &self.country {
            match proxy.country_code() {
                Some(code) if code.eq_ignore_ascii_case(country) => {}
                _ => return false,
            }
        }
        TypeFilter::matches_all(&self.types, self.strict, proxy)
    }
}

impl From<Scheme> for ProxyFilter {
    fn from(scheme: Scheme) -> Self {
        ProxyFilter::new(scheme)
    }
}

struct Entry {
    proxy: Proxy,
    seq: u64,
}

#[derive(Default)]
struct PoolState {
    available: Vec<Entry>,
    checked_out: HashSet<(String, u16)>,
    retired: HashSet<(String, u16)>,
    waiters: usize,
    next_seq: u64,
    source_closed: bool,
    shutdown: bool,
}

impl PoolState {
    fn insert(&mut self, proxy: Proxy) -> bool {
        let key = proxy.key();
        if !proxy.is_verified()
            || self.retired.contains(&key)
            || self.checked_out.contains(&key)
            || self.available.iter().any(|e| e.proxy.key() == key)
        {
            return false;
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.available.push(Entry { proxy, seq });
        true
    }

    /// Take the best matching proxy: fewest consecutive failures, then
    /// lowest average latency, then the one waiting longest
    fn checkout(&mut self, filter: &ProxyFilter) -> Option<Proxy> {
        let index = self
            .available
            .iter()
            .enumerate()
            .filter(|(_, e)| filter.matches(&e.proxy))
            .min_by_key(|(_, e)| {
                (
                    e.proxy.fails,
                    e.proxy.avg_resp_time().unwrap_or(Duration::MAX),
                    e.seq,
                )
            })
            .map(|(i, _)| i)?;

        let entry = self.available.swap_remove(index);
        self.checked_out.insert(entry.proxy.key());
        Some(entry.proxy)
    }

    fn wants_import(&self, min_available: usize) -> bool {
        !self.source_closed && (self.available.len() < min_available || self.waiters > 0)
    }
}

struct PoolInner {
    config: PoolConfig,
    state: Mutex<PoolState>,
    /// Signalled whenever a proxy becomes available or the pool state changes
    changed: Notify,
    /// Wakes the feeder
    demand: Arc<Notify>,
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        self.demand.notify_one();
    }
}

/// Decrements the waiter count even when `get` is cancelled
struct WaiterGuard<'a>(&'a PoolInner);

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.0.state.lock().waiters -= 1;
    }
}

/// Pool of verified proxies
///
/// Cloning is cheap and every clone shares the same pool.
#[derive(Clone)]
pub struct ProxyPool {
    inner: Arc<PoolInner>,
}

impl ProxyPool {
    /// Create a pool fed by the broker queue. Must be called within a tokio runtime.
    pub fn new(queue: mpsc::Receiver<Proxy>, config: PoolConfig) -> Self {
        let demand = Arc::new(Notify::new());
        let inner = Arc::new(PoolInner {
            config,
            state: Mutex::new(PoolState::default()),
            changed: Notify::new(),
            demand: Arc::clone(&demand),
        });

        tokio::spawn(feed(Arc::downgrade(&inner), demand, queue));
        Self { inner }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Check out a proxy matching `filter`.
    ///
    /// Waits up to `wait_timeout` for one to arrive from the broker or to be
    /// returned by another consumer. Fails with [`Error::NoProxy`] on timeout,
    /// after shutdown, or right away once the broker queue is closed and no
    /// proxy is left that could come back.
    pub async fn get(&self, filter: &ProxyFilter) -> Result<Proxy> {
        let deadline = Instant::now() + self.inner.config.wait_timeout;
        let mut waiter: Option<WaiterGuard<'_>> = None;

        loop {
            let changed = self.inner.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            {
                let mut state = self.inner.state.lock();
                if state.shutdown {
                    return Err(Error::NoProxy);
                }
                if let Some(proxy) = state.checkout(filter) {
                    if state.wants_import(self.inner.config.min_available) {
                        self.inner.demand.notify_one();
                    }
                    debug!("{} checked out", proxy);
                    return Ok(proxy);
                }
                if state.source_closed && state.checked_out.is_empty() {
                    return Err(Error::NoProxy);
                }
                if waiter.is_none() {
                    state.waiters += 1;
                    waiter = Some(WaiterGuard(&self.inner));
                    self.inner.demand.notify_one();
                }
            }

            if tokio::time::timeout_at(deadline, changed).await.is_err() {
                debug!("No proxy for {} within {:?}", filter.scheme, self.inner.config.wait_timeout);
                return Err(Error::NoProxy);
            }
        }
    }

    /// Return a checked-out proxy with the outcome of its use.
    ///
    /// Success resets the consecutive failure count. Failure increments it and
    /// a proxy past the configured limits is retired instead of re-inserted.
    /// Returning to a pool that was shut down, or returning a proxy that is
    /// not currently checked out, does nothing.
    pub fn put(&self, mut proxy: Proxy, success: bool) {
        {
            let mut state = self.inner.state.lock();
            if state.shutdown {
                return;
            }

            let key = proxy.key();
            if !state.checked_out.remove(&key) {
                debug!("{} returned but not checked out, ignored", proxy);
                return;
            }
            if success {
                proxy.record_success();
            } else {
                proxy.record_failure();
            }

            match self.inner.config.retire_reason(&proxy) {
                Some(reason) => {
                    info!("{} retired: {}", proxy, reason);
                    state.retired.insert(key);
                }
                None => {
                    state.insert(proxy);
                }
            }
        }
        self.inner.changed.notify_waiters();
    }

    /// Close the pool; waiting consumers fail with [`Error::NoProxy`]
    pub fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock();
            state.shutdown = true;
            state.available.clear();
        }
        self.inner.changed.notify_waiters();
        self.inner.demand.notify_one();
    }

    /// Proxies currently available
    pub fn len(&self) -> usize {
        self.inner.state.lock().available.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn checked_out(&self) -> usize {
        self.inner.state.lock().checked_out.len()
    }

    /// Proxies retired so far. Retired keys are kept for the lifetime of the
    /// pool so they are never admitted again.
    pub fn retired(&self) -> usize {
        self.inner.state.lock().retired.len()
    }

    fn admit(&self, proxy: Proxy) {
        if self.inner.state.lock().insert(proxy) {
            self.inner.changed.notify_waiters();
        }
    }
}

/// Move proxies from the broker queue into the pool on demand.
///
/// Holds only a weak reference across awaits so dropping the last pool
/// handle stops the task.
async fn feed(pool: Weak<PoolInner>, demand: Arc<Notify>, mut queue: mpsc::Receiver<Proxy>) {
    loop {
        let wanted = match pool.upgrade() {
            Some(inner) => {
                let state = inner.state.lock();
                if state.shutdown {
                    return;
                }
                state.wants_import(inner.config.min_available)
            }
            None => return,
        };

        if !wanted {
            demand.notified().await;
            continue;
        }

        let received = tokio::select! {
            received = queue.recv() => received,
            _ = demand.notified() => continue,
        };

        let Some(inner) = pool.upgrade() else {
            return;
        };
        let pool_handle = ProxyPool { inner };
        match received {
            Some(proxy) => pool_handle.admit(proxy),
            None => {
                debug!("Proxy queue closed");
                pool_handle.inner.state.lock().source_closed = true;
                pool_handle.inner.changed.notify_waiters();
                return;
            }
        }
    }
}
