//! Relay (proxy) candidates: ranking, health probing and rotation.
//!
//! - [`scoring`]: provider-reported uptime/latency into a single score
//! - [`pool`]: per-job ranked pool with a failure set and lazy refresh
//! - [`cache`]: TTL-cached provider wrapper shared read-only across jobs

pub mod cache;
pub mod pool;
pub mod scoring;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use cache::CachedProvider;
pub use pool::{PoolSnapshot, RelayPool};
pub use scoring::{SourceTier, compute_score};

/// Protocol spoken by a relay endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayProtocol {
    Http,
    Https,
    Socks4,
    Socks5,
}

impl RelayProtocol {
    pub fn scheme(&self) -> &'static str {
        match self {
            RelayProtocol::Http => "http",
            RelayProtocol::Https => "https",
            RelayProtocol::Socks4 => "socks4",
            RelayProtocol::Socks5 => "socks5",
        }
    }
}

impl fmt::Display for RelayProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.scheme())
    }
}

impl FromStr for RelayProtocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "http" => Ok(RelayProtocol::Http),
            "https" => Ok(RelayProtocol::Https),
            "socks4" => Ok(RelayProtocol::Socks4),
            "socks5" | "socks" => Ok(RelayProtocol::Socks5),
            _ => Err(format!("Unknown relay protocol: {}", s)),
        }
    }
}

/// A network relay that scraping traffic can be routed through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayCandidate {
    /// `host:port`, unique within one pool generation.
    pub address: String,
    /// Provider that reported this candidate.
    pub source_id: String,
    /// Higher is better.
    pub score: f64,
    /// Provider-reported uptime percentage (0-100).
    pub uptime: f64,
    /// Provider-reported latency in milliseconds.
    pub latency_ms: u64,
    pub protocol: RelayProtocol,
}

impl RelayCandidate {
    /// Builds a candidate and scores it for the given source tier.
    pub fn scored(
        address: impl Into<String>,
        source_id: impl Into<String>,
        protocol: RelayProtocol,
        uptime: f64,
        latency_ms: u64,
        tier: SourceTier,
    ) -> Self {
        Self {
            address: address.into(),
            source_id: source_id.into(),
            score: compute_score(uptime, latency_ms, tier),
            uptime,
            latency_ms,
            protocol,
        }
    }

    /// Proxy URL in `scheme://host:port` form.
    pub fn proxy_url(&self) -> String {
        format!("{}://{}", self.protocol.scheme(), self.address)
    }
}

impl fmt::Display for RelayCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, score {:.1})", self.proxy_url(), self.source_id, self.score)
    }
}
