//! Proxy Broker - Proxy Finder, Checker and Pool
//!
//! Finds public proxies, checks them against judges and serves the working
//! ones through a pool that concurrent consumers check proxies out of.
//!
//! ```no_run
//! use proxy_broker::{Broker, BrokerConfig, FindQuery, PoolConfig, ProxyFilter, ProxyPool, Scheme};
//! use tokio::sync::mpsc;
//!
//! # async fn run() -> proxy_broker::Result<()> {
//! let (tx, rx) = mpsc::channel(100);
//! let broker = Broker::new(tx, BrokerConfig::default())?;
//! let pool = ProxyPool::new(rx, PoolConfig::default());
//!
//! tokio::spawn(async move { broker.find(FindQuery::new().with_limit(10)).await });
//!
//! let proxy = pool.get(&ProxyFilter::new(Scheme::Http)).await?;
//! // ... use the proxy ...
//! pool.put(proxy, true);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod proxy;

pub use config::Config;
pub use error::{Error, Result};
pub use proxy::*;
