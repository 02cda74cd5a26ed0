use std::sync::Arc;
use std::time::Duration;

use leadhound_core::error::AppError;
use leadhound_core::relay::{CachedProvider, RelayPool, RelayProtocol};
use leadhound_core::traits::RelayProvider;
use url::Url;

use crate::probe::{HttpRelayProbe, ProbeConfig};
use crate::providers::{GeonodeProvider, ProxyListProvider, StaticProvider};

/// Where relay candidates come from and how they are checked.
#[derive(Debug, Clone, Default)]
pub struct RelaySourcesConfig {
    /// Plaintext `host:port` lists.
    pub list_urls: Vec<String>,
    pub geonode_url: Option<String>,
    /// Fixed fallback relays (`host:port` or `scheme://host:port`).
    pub fallback_relays: Vec<String>,
    pub probe: ProbeConfig,
    /// How long fetched candidate lists are shared between jobs.
    pub cache_ttl: Duration,
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split([',', '\n'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_millis(key: &str, raw: &str) -> Result<Duration, AppError> {
    let millis: u64 = raw.trim().parse().map_err(|_| {
        AppError::ConfigError(format!(
            "Invalid {key} '{raw}': must be a positive integer"
        ))
    })?;
    if millis == 0 {
        return Err(AppError::ConfigError(format!("{key} must be at least 1")));
    }
    Ok(Duration::from_millis(millis))
}

fn check_url(key: &str, raw: &str) -> Result<String, AppError> {
    Url::parse(raw)
        .map(|_| raw.to_string())
        .map_err(|e| AppError::ConfigError(format!("Invalid {key} entry '{raw}': {e}")))
}

impl RelaySourcesConfig {
    /// Read configuration from environment variables.
    ///
    /// - `LEADHOUND_RELAY_LIST_URLS` (comma separated, optional)
    /// - `LEADHOUND_GEONODE_URL` (optional)
    /// - `LEADHOUND_FALLBACK_RELAYS` (comma separated, optional)
    /// - `LEADHOUND_PROBE_URL` (optional)
    /// - `LEADHOUND_PROBE_TIMEOUT_MS` (optional, defaults to 5000)
    /// - `LEADHOUND_RELAY_CACHE_SECS` (optional, defaults to 300)
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let list_urls = lookup("LEADHOUND_RELAY_LIST_URLS")
            .map(|raw| split_list(&raw))
            .unwrap_or_default()
            .iter()
            .map(|u| check_url("LEADHOUND_RELAY_LIST_URLS", u))
            .collect::<Result<Vec<_>, _>>()?;

        let geonode_url = lookup("LEADHOUND_GEONODE_URL")
            .map(|raw| raw.trim().to_string())
            .filter(|raw| !raw.is_empty())
            .map(|raw| check_url("LEADHOUND_GEONODE_URL", &raw))
            .transpose()?;

        let fallback_relays = lookup("LEADHOUND_FALLBACK_RELAYS")
            .map(|raw| split_list(&raw))
            .unwrap_or_default();
        // Surface malformed fallback entries now rather than at first refresh.
        StaticProvider::from_specs("fallback", &fallback_relays)?;

        let mut probe = ProbeConfig::default();
        if let Some(url) = lookup("LEADHOUND_PROBE_URL") {
            probe = probe.with_url(check_url("LEADHOUND_PROBE_URL", url.trim())?);
        }
        if let Some(raw) = lookup("LEADHOUND_PROBE_TIMEOUT_MS") {
            probe = probe.with_timeout(parse_millis("LEADHOUND_PROBE_TIMEOUT_MS", &raw)?);
        }

        let cache_ttl = match lookup("LEADHOUND_RELAY_CACHE_SECS") {
            None => Duration::from_secs(300),
            Some(raw) => {
                let secs: u64 = raw.trim().parse().map_err(|_| {
                    AppError::ConfigError(format!(
                        "Invalid LEADHOUND_RELAY_CACHE_SECS '{raw}': must be a non-negative integer"
                    ))
                })?;
                Duration::from_secs(secs)
            }
        };

        Ok(Self {
            list_urls,
            geonode_url,
            fallback_relays,
            probe,
            cache_ttl,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.list_urls.is_empty() && self.geonode_url.is_none() && self.fallback_relays.is_empty()
    }

    /// Build the shared provider set. List sources are wrapped in a TTL cache;
    /// the fallback list is static.
    pub fn build(&self) -> Result<RelaySources, AppError> {
        let mut providers: Vec<Arc<dyn RelayProvider>> = Vec::new();
        let cached = |inner: Arc<dyn RelayProvider>| -> Arc<dyn RelayProvider> {
            if self.cache_ttl.is_zero() {
                inner
            } else {
                Arc::new(CachedProvider::new(inner, self.cache_ttl))
            }
        };

        for url in &self.list_urls {
            providers.push(cached(Arc::new(ProxyListProvider::new(
                url.clone(),
                RelayProtocol::Http,
            )?)));
        }
        if let Some(url) = &self.geonode_url {
            providers.push(cached(Arc::new(GeonodeProvider::new(url.clone())?)));
        }
        if !self.fallback_relays.is_empty() {
            providers.push(Arc::new(StaticProvider::from_specs(
                "fallback",
                &self.fallback_relays,
            )?));
        }

        tracing::info!(providers = providers.len(), "Relay sources configured");
        Ok(RelaySources {
            providers,
            probe: HttpRelayProbe::new(self.probe.clone()),
        })
    }
}

/// Relay providers shared by every job, plus the probe each job's pool uses.
#[derive(Clone)]
pub struct RelaySources {
    providers: Vec<Arc<dyn RelayProvider>>,
    probe: HttpRelayProbe,
}

impl RelaySources {
    /// A fresh pool for one job. Pools share provider caches, never failure
    /// sets.
    pub fn pool(&self) -> RelayPool<HttpRelayProbe> {
        RelayPool::new(self.providers.clone(), self.probe.clone())
    }

    pub fn providers(&self) -> &[Arc<dyn RelayProvider>] {
        &self.providers
    }
}
