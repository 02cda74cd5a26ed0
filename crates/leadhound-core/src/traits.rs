use std::future::Future;
use std::time::Duration;

use futures::future::BoxFuture;
use uuid::Uuid;

use crate::error::AppError;
use crate::job::{JobConfig, JobProgress, JobStatus, SearchParams};
use crate::models::{Lead, LogEntry, SessionCookie, WorkUnit};
use crate::relay::RelayCandidate;

/// One browser tab-equivalent driven by the engine.
///
/// Implementations map transport failures through
/// [`AppError::from_transport`] so callers can route on the error kind.
pub trait PageSession: Send + Sync {
    /// Navigate and wait for the page to load, bounded by `timeout`.
    fn navigate(
        &self,
        url: &str,
        timeout: Duration,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// URL of the current document after any redirects.
    fn current_url(&self) -> impl Future<Output = Result<String, AppError>> + Send;

    /// Serialized DOM of the current document.
    fn content(&self) -> impl Future<Output = Result<String, AppError>> + Send;

    /// Run an extraction script in the page and return its JSON result.
    fn evaluate(
        &self,
        script: &str,
    ) -> impl Future<Output = Result<serde_json::Value, AppError>> + Send;

    /// Best-effort screenshot; failures are swallowed.
    fn screenshot(&self) -> impl Future<Output = Option<Vec<u8>>> + Send;

    fn set_cookies(
        &self,
        cookies: &[SessionCookie],
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    fn close(self) -> impl Future<Output = ()> + Send;
}

/// Opens page sessions, optionally routed through a relay.
pub trait SessionFactory: Send + Sync + Clone {
    type Session: PageSession + 'static;

    fn open(
        &self,
        relay: Option<&RelayCandidate>,
    ) -> impl Future<Output = Result<Self::Session, AppError>> + Send;
}

/// Site-specific search/collection routine run by the producer lane.
pub trait Collector: Send + Sync + Clone {
    /// Run collection pass number `pass` (0-based), returning up to roughly
    /// `wanted` candidate units. Returning nothing new ends collection.
    fn collect<S: PageSession>(
        &self,
        session: &S,
        params: &SearchParams,
        pass: u32,
        wanted: usize,
    ) -> impl Future<Output = Result<Vec<WorkUnit>, AppError>> + Send;
}

/// Site-specific record extraction run by the worker lane.
///
/// Must be safe to call against two independent sessions concurrently.
pub trait Extractor: Send + Sync + Clone {
    fn extract<S: PageSession>(
        &self,
        session: &S,
        unit: &WorkUnit,
    ) -> impl Future<Output = Result<Lead, AppError>> + Send;
}

/// Source of relay candidates. Never fails: errors yield an empty list.
pub trait RelayProvider: Send + Sync {
    fn source_id(&self) -> &str;

    fn fetch_candidates(&self) -> BoxFuture<'_, Vec<RelayCandidate>>;
}

/// Short-timeout reachability check for a relay.
pub trait RelayProbe: Send + Sync + Clone {
    fn probe(&self, candidate: &RelayCandidate) -> impl Future<Output = bool> + Send;
}

/// Everything handed to persistence at a terminal transition.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ResultRecord<'a> {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub config: &'a JobConfig,
    pub progress: &'a JobProgress,
    pub logs: &'a [LogEntry],
    pub results: &'a [Lead],
}

/// Persists job results.
pub trait ResultStore: Send + Sync + Clone {
    /// Save results, returning a location handle (path, key, URL, ...).
    fn save_results(
        &self,
        record: &ResultRecord<'_>,
    ) -> impl Future<Output = Result<String, AppError>> + Send;
}

/// A no-op ResultStore for use when persistence is not needed.
#[derive(Debug, Clone)]
pub struct NullStore;

impl ResultStore for NullStore {
    async fn save_results(&self, _record: &ResultRecord<'_>) -> Result<String, AppError> {
        Ok(String::new())
    }
}

/// Probe for orchestrators that run without a relay pool.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullProbe;

impl RelayProbe for NullProbe {
    async fn probe(&self, _candidate: &RelayCandidate) -> bool {
        false
    }
}
