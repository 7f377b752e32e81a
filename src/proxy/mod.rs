//! Proxy discovery, verification and distribution
//!
//! This module provides:
//! - Candidate parsing and providers yielding raw `host:port` candidates
//! - Judges and anonymity classification
//! - The checker verifying candidates under a concurrency limit
//! - The broker running the discovery pipeline
//! - The pool handing verified proxies to consumers

pub mod anonymity;
pub mod broker;
pub mod checker;
pub mod geo;
pub mod judge;
pub mod models;
pub mod parser;
pub mod pool;
pub mod provider;

pub use anonymity::{classify, classify_against};
pub use broker::{Broker, BrokerConfig, FindQuery, RunStats};
pub use checker::{Checker, CheckerConfig};
pub use geo::{GeoLocation, GeoLocator, GeoLookup};
pub use judge::{HttpJudge, Judge, JudgeVerdict, ObservedRequest};
pub use models::{Anonymity, Candidate, CheckOutcome, ProbeStatus, Proxy, ProxyType, Scheme, TypeFilter};
pub use parser::CandidateParser;
pub use pool::{PoolConfig, ProxyFilter, ProxyPool};
pub use provider::{Provider, ProviderConfig, ProviderSource, StaticProvider, UrlProvider};
