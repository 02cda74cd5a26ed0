//! Relay candidate sources.
//!
//! Providers never fail: transport and parse errors are logged and yield an
//! empty batch, so one broken source never blocks a pool refresh.

use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use leadhound_core::error::AppError;
use leadhound_core::relay::{RelayCandidate, RelayProtocol, SourceTier};
use leadhound_core::traits::RelayProvider;
use reqwest::Client;
use serde::Deserialize;
use url::Url;

/// Assumed for list entries that carry no quality data.
const UNRATED_UPTIME: f64 = 50.0;
const UNRATED_LATENCY_MS: u64 = 2_000;

fn http_client(timeout: Duration) -> Result<Client, AppError> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| AppError::Generic(format!("HTTP client error: {e}")))
}

async fn fetch_body(client: &Client, source: &str, url: &str) -> Option<String> {
    let response = match client.get(url).send().await {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(%source, error = %e, "Relay source unreachable");
            return None;
        }
    };
    if !response.status().is_success() {
        tracing::warn!(%source, status = response.status().as_u16(), "Relay source returned an error");
        return None;
    }
    match response.text().await {
        Ok(body) => Some(body),
        Err(e) => {
            tracing::warn!(%source, error = %e, "Failed to read relay source body");
            None
        }
    }
}

/// Parse a relay given as `host:port` or `scheme://host:port`.
///
/// Bare addresses default to `default_protocol`. Credentials are rejected:
/// Chromium's `--proxy-server` cannot carry them.
pub fn parse_relay_spec(
    spec: &str,
    source_id: &str,
    default_protocol: RelayProtocol,
    tier: SourceTier,
) -> Result<RelayCandidate, AppError> {
    let spec = spec.trim();
    let (protocol, rest) = match spec.split_once("://") {
        Some((scheme, rest)) => (
            scheme
                .parse::<RelayProtocol>()
                .map_err(AppError::ConfigError)?,
            rest,
        ),
        None => (default_protocol, spec),
    };

    let url = Url::parse(&format!("http://{rest}"))
        .map_err(|e| AppError::ConfigError(format!("Invalid relay '{spec}': {e}")))?;
    if !url.username().is_empty() || url.password().is_some() {
        return Err(AppError::ConfigError(format!(
            "Relay '{spec}' carries credentials, which are not supported"
        )));
    }
    let host = url
        .host_str()
        .ok_or_else(|| AppError::ConfigError(format!("Relay '{spec}' has no host")))?;
    // Url::port() hides scheme-default ports, so read it from the text.
    let port: u16 = rest
        .trim_end_matches('/')
        .rsplit_once(':')
        .and_then(|(_, port)| port.parse().ok())
        .ok_or_else(|| AppError::ConfigError(format!("Relay '{spec}' has no port")))?;

    Ok(RelayCandidate::scored(
        format!("{host}:{port}"),
        source_id,
        protocol,
        UNRATED_UPTIME,
        UNRATED_LATENCY_MS,
        tier,
    ))
}

/// Parse a plaintext list, one relay per line. Blank lines and `#` comments
/// are skipped; malformed lines are dropped.
pub fn parse_relay_list(body: &str, source_id: &str, protocol: RelayProtocol) -> Vec<RelayCandidate> {
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            parse_relay_spec(line, source_id, protocol, SourceTier::Free)
                .inspect_err(|e| tracing::trace!(%source_id, %line, error = %e, "Skipping relay line"))
                .ok()
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Plaintext lists
// ---------------------------------------------------------------------------

/// Free relay list served as plain text (`host:port` per line).
#[derive(Debug, Clone)]
pub struct ProxyListProvider {
    source_id: String,
    url: String,
    protocol: RelayProtocol,
    client: Client,
}

impl ProxyListProvider {
    pub fn new(url: impl Into<String>, protocol: RelayProtocol) -> Result<Self, AppError> {
        let url = url.into();
        let source_id = Url::parse(&url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| url.clone());
        Ok(Self {
            source_id,
            url,
            protocol,
            client: http_client(Duration::from_secs(15))?,
        })
    }
}

impl RelayProvider for ProxyListProvider {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn fetch_candidates(&self) -> BoxFuture<'_, Vec<RelayCandidate>> {
        async move {
            match fetch_body(&self.client, &self.source_id, &self.url).await {
                Some(body) => parse_relay_list(&body, &self.source_id, self.protocol),
                None => Vec::new(),
            }
        }
        .boxed()
    }
}

// ---------------------------------------------------------------------------
// Geonode-style JSON API
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct GeonodeResponse {
    #[serde(default)]
    data: Vec<GeonodeEntry>,
}

#[derive(Debug, Deserialize)]
struct GeonodeEntry {
    ip: String,
    port: String,
    #[serde(default)]
    protocols: Vec<String>,
    #[serde(rename = "upTime", default)]
    up_time: Option<f64>,
    #[serde(default)]
    latency: Option<f64>,
}

/// Parse a Geonode `proxy-list` response. Entries with an unknown protocol
/// are skipped; the first supported protocol of an entry wins.
pub fn parse_geonode(body: &str, source_id: &str) -> Result<Vec<RelayCandidate>, AppError> {
    let response: GeonodeResponse = serde_json::from_str(body)?;
    let candidates = response
        .data
        .into_iter()
        .filter_map(|entry| {
            let protocol = entry
                .protocols
                .iter()
                .find_map(|p| p.parse::<RelayProtocol>().ok())?;
            let port: u16 = entry.port.trim().parse().ok()?;
            Some(RelayCandidate::scored(
                format!("{}:{}", entry.ip.trim(), port),
                source_id,
                protocol,
                entry.up_time.unwrap_or(UNRATED_UPTIME),
                entry
                    .latency
                    .filter(|l| l.is_finite() && *l >= 0.0)
                    .map_or(UNRATED_LATENCY_MS, |l| l.round() as u64),
                SourceTier::Free,
            ))
        })
        .collect();
    Ok(candidates)
}

/// Free relays from a Geonode-compatible JSON endpoint, which reports
/// uptime and latency per entry.
#[derive(Debug, Clone)]
pub struct GeonodeProvider {
    url: String,
    client: Client,
}

impl GeonodeProvider {
    pub const SOURCE_ID: &'static str = "geonode";

    pub fn new(url: impl Into<String>) -> Result<Self, AppError> {
        Ok(Self {
            url: url.into(),
            client: http_client(Duration::from_secs(15))?,
        })
    }
}

impl RelayProvider for GeonodeProvider {
    fn source_id(&self) -> &str {
        Self::SOURCE_ID
    }

    fn fetch_candidates(&self) -> BoxFuture<'_, Vec<RelayCandidate>> {
        async move {
            let Some(body) = fetch_body(&self.client, Self::SOURCE_ID, &self.url).await else {
                return Vec::new();
            };
            parse_geonode(&body, Self::SOURCE_ID).unwrap_or_else(|e| {
                tracing::warn!(source = Self::SOURCE_ID, error = %e, "Unparseable relay list");
                Vec::new()
            })
        }
        .boxed()
    }
}

// ---------------------------------------------------------------------------
// Static fallback
// ---------------------------------------------------------------------------

/// Fixed relays, typically paid endpoints, scored in the fallback tier so
/// the pool reaches them only after every free candidate failed.
#[derive(Debug, Clone)]
pub struct StaticProvider {
    source_id: String,
    candidates: Vec<RelayCandidate>,
}

impl StaticProvider {
    pub fn new(source_id: impl Into<String>, candidates: Vec<RelayCandidate>) -> Self {
        Self {
            source_id: source_id.into(),
            candidates,
        }
    }

    /// Parse specs into fallback-tier candidates.
    pub fn from_specs<I, S>(source_id: &str, specs: I) -> Result<Self, AppError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let candidates = specs
            .into_iter()
            .map(|s| parse_relay_spec(s.as_ref(), source_id, RelayProtocol::Http, SourceTier::Fallback))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(source_id, candidates))
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

impl RelayProvider for StaticProvider {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn fetch_candidates(&self) -> BoxFuture<'_, Vec<RelayCandidate>> {
        let candidates = self.candidates.clone();
        async move { candidates }.boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_relay_spec_variants() {
        let bare = parse_relay_spec("10.0.0.1:8080", "list", RelayProtocol::Http, SourceTier::Free)
            .unwrap();
        assert_eq!(bare.address, "10.0.0.1:8080");
        assert_eq!(bare.protocol, RelayProtocol::Http);

        let socks = parse_relay_spec(
            "socks5://relay.example:1080",
            "list",
            RelayProtocol::Http,
            SourceTier::Free,
        )
        .unwrap();
        assert_eq!(socks.proxy_url(), "socks5://relay.example:1080");
    }

    #[test]
    fn test_parse_relay_spec_rejects_bad_input() {
        for spec in ["10.0.0.1", "ftp://10.0.0.1:21", "user:pw@10.0.0.1:80", ":80"] {
            assert!(
                parse_relay_spec(spec, "list", RelayProtocol::Http, SourceTier::Free).is_err(),
                "{spec} should be rejected"
            );
        }
    }

    #[test]
    fn test_parse_relay_list_skips_noise() {
        let body = "# free list\n10.0.0.1:80\n\n  10.0.0.2:3128  \ngarbage\n";
        let list = parse_relay_list(body, "list", RelayProtocol::Http);
        let addrs: Vec<_> = list.iter().map(|c| c.address.as_str()).collect();
        assert_eq!(addrs, vec!["10.0.0.1:80", "10.0.0.2:3128"]);
        assert!(list.iter().all(|c| c.source_id == "list"));
    }

    #[test]
    fn test_parse_geonode() {
        let body = r#"{"data":[
            {"ip":"1.2.3.4","port":"8080","protocols":["http"],"upTime":99.0,"latency":120.4},
            {"ip":"5.6.7.8","port":"1080","protocols":["socks5"],"upTime":40.0},
            {"ip":"9.9.9.9","port":"80","protocols":["carrier-pigeon"]},
            {"ip":"1.1.1.1","port":"nope","protocols":["http"]}
        ],"total":4}"#;
        let list = parse_geonode(body, "geonode").unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].latency_ms, 120);
        assert_eq!(list[1].protocol, RelayProtocol::Socks5);
        assert_eq!(list[1].latency_ms, UNRATED_LATENCY_MS);
        assert!(list[0].score > list[1].score);
    }

    #[test]
    fn test_parse_geonode_rejects_non_json() {
        assert!(parse_geonode("<html>rate limited</html>", "geonode").is_err());
    }

    #[tokio::test]
    async fn static_provider_scores_below_free_candidates() {
        let provider = StaticProvider::from_specs("paid", ["10.9.9.9:80"]).unwrap();
        let free = parse_relay_list("10.0.0.1:80", "list", RelayProtocol::Http);

        let paid = provider.fetch_candidates().await;

        assert_eq!(paid.len(), 1);
        assert!(paid[0].score < free[0].score);
        assert_eq!(provider.source_id(), "paid");
    }
}
