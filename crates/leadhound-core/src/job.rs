use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::rate::RateConfig;

/// Lifecycle state of a job.
///
/// ```text
/// Idle -> Initializing -> Running <-> Paused
///                            |  ^
///                            v  |
///                      PausedForAuth
/// Running/Paused/PausedForAuth/Initializing -> Completed | Cancelled | Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Idle,
    Initializing,
    Running,
    Paused,
    PausedForAuth,
    Completed,
    Cancelled,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Idle => "idle",
            JobStatus::Initializing => "initializing",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::PausedForAuth => "paused_for_auth",
            JobStatus::Completed => "completed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Idle, Initializing) | (Idle, Cancelled) => true,
            (Initializing, Running) | (Initializing, Failed) | (Initializing, Cancelled) => true,
            (Running, Paused)
            | (Running, PausedForAuth)
            | (Running, Completed)
            | (Running, Cancelled)
            | (Running, Failed) => true,
            (Paused, Running) | (Paused, PausedForAuth) | (Paused, Cancelled) | (Paused, Failed) => {
                true
            }
            (PausedForAuth, Running) | (PausedForAuth, Cancelled) | (PausedForAuth, Failed) => {
                true
            }
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "idle" => Ok(JobStatus::Idle),
            "initializing" => Ok(JobStatus::Initializing),
            "running" => Ok(JobStatus::Running),
            "paused" => Ok(JobStatus::Paused),
            "paused_for_auth" => Ok(JobStatus::PausedForAuth),
            "completed" => Ok(JobStatus::Completed),
            "cancelled" => Ok(JobStatus::Cancelled),
            "failed" => Ok(JobStatus::Failed),
            _ => Err(format!("Unknown job status: {}", s)),
        }
    }
}

/// Search parameters handed to the collector.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchParams {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// Collector-specific options.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl SearchParams {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

/// Per-job configuration. Built once at submission, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub params: SearchParams,
    /// Number of leads wanted.
    pub target: usize,
    /// Lead attributes that must be present; leads lacking one are skipped.
    pub required_fields: Vec<String>,
    /// Route traffic through relays.
    pub use_relays: bool,
    /// Fall back to direct mode when no relay is reachable.
    pub allow_direct: bool,
}

impl JobConfig {
    pub fn new(params: SearchParams, target: usize) -> Self {
        Self {
            params,
            target,
            required_fields: Vec::new(),
            use_relays: false,
            allow_direct: true,
        }
    }

    pub fn with_required_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_relays(mut self, use_relays: bool) -> Self {
        self.use_relays = use_relays;
        self
    }

    pub fn with_allow_direct(mut self, allow_direct: bool) -> Self {
        self.allow_direct = allow_direct;
        self
    }
}

/// Engine tuning shared by all jobs of an orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Over-collection factor absorbing filter and extraction losses.
    pub collection_margin: f64,
    pub max_collection_passes: u32,
    /// Responsiveness bound for pause, cancel and empty-queue polling.
    pub poll_interval: Duration,
    pub collection_timeout: Duration,
    pub extraction_timeout: Duration,
    /// Relay attempts during initialization before falling back to direct.
    pub init_relay_attempts: u32,
    /// Rotations allowed for one work unit before it counts as an error.
    pub max_unit_retries: u32,
    /// How long to wait for credentials after an auth wall.
    pub auth_timeout: Duration,
    /// Per-item time assumed before any item has completed.
    pub initial_item_estimate: Duration,
    pub direct_rate: RateConfig,
    pub relayed_rate: RateConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            collection_margin: 1.2,
            max_collection_passes: 5,
            poll_interval: Duration::from_millis(500),
            collection_timeout: Duration::from_secs(180),
            extraction_timeout: Duration::from_secs(90),
            init_relay_attempts: 3,
            max_unit_retries: 2,
            auth_timeout: Duration::from_secs(300),
            initial_item_estimate: Duration::from_secs(8),
            direct_rate: RateConfig::direct(),
            relayed_rate: RateConfig::relayed(),
        }
    }
}

impl OrchestratorConfig {
    pub fn with_collection_margin(mut self, margin: f64) -> Self {
        self.collection_margin = margin.max(1.0);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Bounds on one collection pass and one unit's extraction.
    pub fn with_timeouts(mut self, collection: Duration, extraction: Duration) -> Self {
        self.collection_timeout = collection;
        self.extraction_timeout = extraction;
        self
    }

    pub fn with_auth_timeout(mut self, timeout: Duration) -> Self {
        self.auth_timeout = timeout;
        self
    }

    pub fn with_rates(mut self, direct: RateConfig, relayed: RateConfig) -> Self {
        self.direct_rate = direct;
        self.relayed_rate = relayed;
        self
    }

    /// Units to request for `remaining` more leads, margin included.
    pub fn collection_quota(&self, remaining: usize) -> usize {
        (remaining as f64 * self.collection_margin).ceil() as usize
    }
}

/// Progress counters of one job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    /// Units waiting in the queue.
    pub queued: usize,
    pub success_count: usize,
    pub error_count: usize,
    pub skipped_count: usize,
    /// Connectivity errors handled by rotating the relay.
    pub rotations: usize,
    /// Units taken off the queue.
    pub current: usize,
    /// Units enqueued over the whole job.
    pub total: usize,
    pub target: usize,
    pub percentage: f64,
    pub eta_secs: Option<u64>,
}

impl JobProgress {
    pub fn new(target: usize) -> Self {
        Self {
            target,
            ..Default::default()
        }
    }

    /// Recompute the derived fields.
    pub fn refresh(&mut self, eta: &EtaEstimator, elapsed: Duration) {
        self.percentage = if self.target == 0 {
            100.0
        } else {
            (self.success_count as f64 * 100.0 / self.target as f64).min(100.0)
        };
        self.eta_secs = eta
            .estimate(self.success_count, self.target, elapsed)
            .map(|d| d.as_secs());
    }
}

/// Blends a fixed per-item assumption with the observed average, weighted
/// by the completion ratio.
#[derive(Debug, Clone)]
pub struct EtaEstimator {
    initial_per_item: Duration,
}

impl EtaEstimator {
    pub fn new(initial_per_item: Duration) -> Self {
        Self { initial_per_item }
    }

    pub fn estimate(&self, completed: usize, target: usize, elapsed: Duration) -> Option<Duration> {
        if target == 0 || completed >= target {
            return Some(Duration::ZERO);
        }
        let ratio = completed as f64 / target as f64;
        let initial = self.initial_per_item.as_secs_f64();
        let observed = if completed == 0 {
            initial
        } else {
            elapsed.as_secs_f64() / completed as f64
        };
        let per_item = initial * (1.0 - ratio) + observed * ratio;
        let remaining = (target - completed) as f64;
        let secs = per_item * remaining;
        secs.is_finite().then(|| Duration::from_secs_f64(secs.max(0.0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_roundtrip() {
        for status in [
            JobStatus::Idle,
            JobStatus::Initializing,
            JobStatus::Running,
            JobStatus::Paused,
            JobStatus::PausedForAuth,
            JobStatus::Completed,
            JobStatus::Cancelled,
            JobStatus::Failed,
        ] {
            let parsed: JobStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(!JobStatus::Running.is_terminal());
        assert!(!JobStatus::PausedForAuth.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_transitions() {
        assert!(JobStatus::Idle.can_transition_to(JobStatus::Initializing));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Paused));
        assert!(JobStatus::Paused.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Running.can_transition_to(JobStatus::PausedForAuth));
        assert!(JobStatus::PausedForAuth.can_transition_to(JobStatus::Failed));
        assert!(!JobStatus::Idle.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Paused.can_transition_to(JobStatus::Completed));
    }

    #[test]
    fn test_collection_quota_applies_margin() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.collection_quota(10), 12);
        assert_eq!(config.collection_quota(1), 2);
        assert_eq!(config.collection_quota(0), 0);
        let config = config.with_collection_margin(0.5);
        assert_eq!(config.collection_quota(10), 10);
    }

    #[test]
    fn test_eta_starts_from_assumption() {
        let eta = EtaEstimator::new(Duration::from_secs(10));
        assert_eq!(
            eta.estimate(0, 5, Duration::ZERO),
            Some(Duration::from_secs(50))
        );
    }

    #[test]
    fn test_eta_blends_toward_observed() {
        let eta = EtaEstimator::new(Duration::from_secs(10));
        // 5 of 10 done in 10s: observed 2s/item, ratio 0.5 -> 6s/item, 5 left.
        assert_eq!(
            eta.estimate(5, 10, Duration::from_secs(10)),
            Some(Duration::from_secs(30))
        );
        assert_eq!(eta.estimate(10, 10, Duration::from_secs(99)), Some(Duration::ZERO));
    }

    #[test]
    fn test_progress_percentage() {
        let eta = EtaEstimator::new(Duration::from_secs(1));
        let mut progress = JobProgress::new(4);
        progress.success_count = 1;
        progress.refresh(&eta, Duration::from_secs(1));
        assert!((progress.percentage - 25.0).abs() < f64::EPSILON);
        progress.success_count = 9;
        progress.refresh(&eta, Duration::from_secs(1));
        assert!((progress.percentage - 100.0).abs() < f64::EPSILON);
        assert_eq!(progress.eta_secs, Some(0));
    }

    #[test]
    fn test_job_config_builder() {
        let config = JobConfig::new(SearchParams::new("dentists").with_location("Recife"), 10)
            .with_required_fields(["phone"])
            .with_relays(true)
            .with_allow_direct(false);
        assert_eq!(config.target, 10);
        assert_eq!(config.required_fields, vec!["phone".to_string()]);
        assert!(config.use_relays);
        assert!(!config.allow_direct);
        assert_eq!(config.params.location.as_deref(), Some("Recife"));
    }
}
