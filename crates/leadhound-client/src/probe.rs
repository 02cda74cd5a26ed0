use std::time::Duration;

use leadhound_core::relay::RelayCandidate;
use leadhound_core::traits::RelayProbe;
use reqwest::{Client, Proxy};

/// Reachability check settings.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Fetched through the relay; any 2xx answer counts as reachable.
    pub url: String,
    pub timeout: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            url: "http://www.gstatic.com/generate_204".to_string(),
            timeout: Duration::from_secs(5),
        }
    }
}

impl ProbeConfig {
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Probes a relay by fetching a tiny page through it.
#[derive(Debug, Clone, Default)]
pub struct HttpRelayProbe {
    config: ProbeConfig,
}

impl HttpRelayProbe {
    pub fn new(config: ProbeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    fn client_for(&self, candidate: &RelayCandidate) -> Result<Client, String> {
        let proxy = Proxy::all(candidate.proxy_url()).map_err(|e| e.to_string())?;
        Client::builder()
            .proxy(proxy)
            .timeout(self.config.timeout)
            .connect_timeout(self.config.timeout)
            .build()
            .map_err(|e| e.to_string())
    }
}

impl RelayProbe for HttpRelayProbe {
    async fn probe(&self, candidate: &RelayCandidate) -> bool {
        let client = match self.client_for(candidate) {
            Ok(client) => client,
            Err(e) => {
                tracing::debug!(relay = %candidate.address, error = %e, "Relay probe setup failed");
                return false;
            }
        };

        match client.get(&self.config.url).send().await {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                tracing::debug!(
                    relay = %candidate.address,
                    status = response.status().as_u16(),
                    "Relay probe got an error status"
                );
                false
            }
            Err(e) => {
                tracing::debug!(relay = %candidate.address, error = %e, "Relay probe failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use leadhound_core::relay::{RelayProtocol, SourceTier};

    use super::*;

    #[tokio::test]
    async fn unreachable_relay_fails_fast() {
        // Port 9 on loopback (discard) refuses connections on a normal host.
        let candidate = RelayCandidate::scored(
            "127.0.0.1:9",
            "test",
            RelayProtocol::Http,
            100.0,
            0,
            SourceTier::Free,
        );
        let probe = HttpRelayProbe::new(
            ProbeConfig::default()
                .with_url("http://probe.invalid/")
                .with_timeout(Duration::from_millis(500)),
        );

        assert!(!probe.probe(&candidate).await);
    }

    #[test]
    fn builders_override_defaults() {
        let config = ProbeConfig::default()
            .with_url("https://probe.example/ok")
            .with_timeout(Duration::from_secs(2));
        let probe = HttpRelayProbe::new(config);
        assert_eq!(probe.config().url, "https://probe.example/ok");
        assert_eq!(probe.config().timeout, Duration::from_secs(2));
    }
}
