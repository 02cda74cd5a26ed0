//! Test utilities: mock implementations of the core traits.
//!
//! Handwritten mocks for dependency injection in unit tests.
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls. Clones share their recordings.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use uuid::Uuid;

use crate::error::AppError;
use crate::job::{JobProgress, JobStatus, SearchParams};
use crate::models::{Lead, SessionCookie, WorkUnit};
use crate::observer::{JobEvent, JobObserver};
use crate::relay::{RelayCandidate, RelayProtocol};
use crate::traits::{
    Collector, Extractor, PageSession, RelayProbe, RelayProvider, ResultRecord, ResultStore,
    SessionFactory,
};
use crate::util::normalize_url;

fn page_key(url: &str) -> String {
    normalize_url(url).unwrap_or_else(|| url.trim().to_string())
}

// ---------------------------------------------------------------------------
// MockSession
// ---------------------------------------------------------------------------

type FailureFn = Arc<dyn Fn() -> AppError + Send + Sync>;

#[derive(Clone)]
enum MockPage {
    Html { final_url: String, html: String },
    Fail(FailureFn),
}

/// In-memory page session serving canned documents.
///
/// Pages are keyed by normalized URL. Navigating to an unknown URL fails
/// with an HTTP 404 navigation error.
#[derive(Clone, Default)]
pub struct MockSession {
    pages: HashMap<String, MockPage>,
    cookie_failure: Option<FailureFn>,
    script_result: Option<serde_json::Value>,
    /// (final url, html) of the loaded document.
    current: Arc<Mutex<Option<(String, String)>>>,
    navigations: Arc<Mutex<Vec<String>>>,
    cookies: Arc<Mutex<Vec<SessionCookie>>>,
    closed: Arc<AtomicBool>,
}

impl MockSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(self, url: &str, html: &str) -> Self {
        self.with_redirect(url, url, html)
    }

    /// Serve `html` for `url`, reporting `final_url` as the current URL.
    pub fn with_redirect(mut self, url: &str, final_url: &str, html: &str) -> Self {
        self.pages.insert(
            page_key(url),
            MockPage::Html {
                final_url: final_url.to_string(),
                html: html.to_string(),
            },
        );
        self
    }

    pub fn with_failure<F>(mut self, url: &str, error: F) -> Self
    where
        F: Fn() -> AppError + Send + Sync + 'static,
    {
        self.pages.insert(page_key(url), MockPage::Fail(Arc::new(error)));
        self
    }

    /// Every `set_cookies` call fails with the given error.
    pub fn with_cookie_failure<F>(mut self, error: F) -> Self
    where
        F: Fn() -> AppError + Send + Sync + 'static,
    {
        self.cookie_failure = Some(Arc::new(error));
        self
    }

    /// Value returned by `evaluate`; `Null` when unset.
    pub fn with_script_result(mut self, value: serde_json::Value) -> Self {
        self.script_result = Some(value);
        self
    }

    /// URLs passed to `navigate`, in call order.
    pub fn navigations(&self) -> Vec<String> {
        self.navigations.lock().unwrap().clone()
    }

    /// Same pages, fresh recordings.
    pub fn fresh(&self) -> Self {
        Self {
            pages: self.pages.clone(),
            cookie_failure: self.cookie_failure.clone(),
            script_result: self.script_result.clone(),
            ..Default::default()
        }
    }

    pub fn cookies(&self) -> Vec<SessionCookie> {
        self.cookies.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl PageSession for MockSession {
    async fn navigate(&self, url: &str, _timeout: Duration) -> Result<(), AppError> {
        self.navigations.lock().unwrap().push(url.to_string());
        match self.pages.get(&page_key(url)) {
            Some(MockPage::Html { final_url, html }) => {
                *self.current.lock().unwrap() = Some((final_url.clone(), html.clone()));
                Ok(())
            }
            Some(MockPage::Fail(error)) => Err(error()),
            None => Err(AppError::Navigation(format!("HTTP 404 for {}", url))),
        }
    }

    async fn current_url(&self) -> Result<String, AppError> {
        self.current
            .lock()
            .unwrap()
            .as_ref()
            .map(|(url, _)| url.clone())
            .ok_or_else(|| AppError::Navigation("no page loaded".into()))
    }

    async fn content(&self) -> Result<String, AppError> {
        self.current
            .lock()
            .unwrap()
            .as_ref()
            .map(|(_, html)| html.clone())
            .ok_or_else(|| AppError::Navigation("no page loaded".into()))
    }

    async fn evaluate(&self, _script: &str) -> Result<serde_json::Value, AppError> {
        Ok(self.script_result.clone().unwrap_or(serde_json::Value::Null))
    }

    async fn screenshot(&self) -> Option<Vec<u8>> {
        Some(b"\x89PNG".to_vec())
    }

    async fn set_cookies(&self, cookies: &[SessionCookie]) -> Result<(), AppError> {
        if let Some(error) = &self.cookie_failure {
            return Err(error());
        }
        self.cookies.lock().unwrap().extend_from_slice(cookies);
        Ok(())
    }

    async fn close(self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// MockSessionFactory
// ---------------------------------------------------------------------------

/// Factory handing out fresh copies of a template session.
#[derive(Clone, Default)]
pub struct MockSessionFactory {
    template: MockSession,
    fail_relays: bool,
    /// Relay opens that succeed before every further relay open fails.
    relay_budget: Option<usize>,
    opened: Arc<Mutex<Vec<Option<String>>>>,
    sessions: Arc<Mutex<Vec<MockSession>>>,
}

impl MockSessionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_template(mut self, template: MockSession) -> Self {
        self.template = template;
        self
    }

    /// Every open through a relay fails with a connectivity error.
    pub fn fail_all_relays(mut self) -> Self {
        self.fail_relays = true;
        self
    }

    /// The first `n` opens through a relay succeed, later ones fail with a
    /// connectivity error.
    pub fn fail_relays_after(mut self, n: usize) -> Self {
        self.relay_budget = Some(n);
        self
    }

    /// Relay address of every open attempt; `None` for direct.
    pub fn opened(&self) -> Vec<Option<String>> {
        self.opened.lock().unwrap().clone()
    }

    /// Sessions successfully opened so far.
    pub fn sessions(&self) -> Vec<MockSession> {
        self.sessions.lock().unwrap().clone()
    }
}

impl SessionFactory for MockSessionFactory {
    type Session = MockSession;

    async fn open(&self, relay: Option<&RelayCandidate>) -> Result<MockSession, AppError> {
        let address = relay.map(|r| r.address.clone());
        let relay_opens = {
            let mut opened = self.opened.lock().unwrap();
            let before = opened.iter().filter(|a| a.is_some()).count();
            opened.push(address.clone());
            before
        };
        let over_budget = self.relay_budget.is_some_and(|budget| relay_opens >= budget);
        if (self.fail_relays || over_budget)
            && let Some(address) = address
        {
            return Err(AppError::Connectivity(format!(
                "net::ERR_PROXY_CONNECTION_FAILED via {}",
                address
            )));
        }
        let session = self.template.fresh();
        self.sessions.lock().unwrap().push(session.clone());
        Ok(session)
    }
}

// ---------------------------------------------------------------------------
// MockCollector
// ---------------------------------------------------------------------------

/// Collector replaying canned passes.
#[derive(Clone, Default)]
pub struct MockCollector {
    /// Returned in full on every pass when set.
    repeating: Option<Vec<WorkUnit>>,
    /// Queue of responses. Each call pops the first element.
    /// If empty, returns no units.
    responses: Arc<Mutex<VecDeque<Result<Vec<WorkUnit>, AppError>>>>,
    calls: Arc<Mutex<Vec<(u32, usize)>>>,
}

impl MockCollector {
    /// Returns the same result page on every pass, like a search that has
    /// no further pages.
    pub fn repeating(units: Vec<WorkUnit>) -> Self {
        Self {
            repeating: Some(units),
            ..Default::default()
        }
    }

    pub fn with_responses(responses: Vec<Result<Vec<WorkUnit>, AppError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses.into())),
            ..Default::default()
        }
    }

    /// `(pass, wanted)` of every call.
    pub fn calls(&self) -> Vec<(u32, usize)> {
        self.calls.lock().unwrap().clone()
    }
}

impl Collector for MockCollector {
    async fn collect<S: PageSession>(
        &self,
        _session: &S,
        _params: &SearchParams,
        pass: u32,
        wanted: usize,
    ) -> Result<Vec<WorkUnit>, AppError> {
        self.calls.lock().unwrap().push((pass, wanted));
        if let Some(units) = &self.repeating {
            return Ok(units.clone());
        }
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
    }
}

// ---------------------------------------------------------------------------
// MockExtractor
// ---------------------------------------------------------------------------

type ExtractFn = dyn Fn(usize, &WorkUnit) -> Result<Lead, AppError> + Send + Sync;

/// Extractor driven by a closure over `(call index, unit)`.
#[derive(Clone)]
pub struct MockExtractor {
    respond: Arc<ExtractFn>,
    delay: Option<Duration>,
    stall_after: Option<usize>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl MockExtractor {
    pub fn from_fn<F>(respond: F) -> Self
    where
        F: Fn(usize, &WorkUnit) -> Result<Lead, AppError> + Send + Sync + 'static,
    {
        Self {
            respond: Arc::new(respond),
            delay: None,
            stall_after: None,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Calls after the first `n` never complete.
    pub fn stall_after(mut self, n: usize) -> Self {
        self.stall_after = Some(n);
        self
    }

    /// Targets of every call, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl Extractor for MockExtractor {
    async fn extract<S: PageSession>(&self, _session: &S, unit: &WorkUnit) -> Result<Lead, AppError> {
        let index = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(unit.target.clone());
            calls.len() - 1
        };
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.stall_after.is_some_and(|n| index >= n) {
            std::future::pending::<()>().await;
        }
        (self.respond)(index, unit)
    }
}

// ---------------------------------------------------------------------------
// MockStore
// ---------------------------------------------------------------------------

/// What a [`MockStore`] received for one save.
#[derive(Debug, Clone)]
pub struct SavedResults {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub results: Vec<Lead>,
    pub progress: JobProgress,
}

#[derive(Clone, Default)]
pub struct MockStore {
    saves: Arc<Mutex<Vec<SavedResults>>>,
    fail: bool,
}

impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every save fails with a persistence error.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn saves(&self) -> Vec<SavedResults> {
        self.saves.lock().unwrap().clone()
    }
}

impl ResultStore for MockStore {
    async fn save_results(&self, record: &ResultRecord<'_>) -> Result<String, AppError> {
        if self.fail {
            return Err(AppError::Persistence("disk full".into()));
        }
        self.saves.lock().unwrap().push(SavedResults {
            job_id: record.job_id,
            status: record.status,
            results: record.results.to_vec(),
            progress: record.progress.clone(),
        });
        Ok(format!("mem://{}", record.job_id))
    }
}

// ---------------------------------------------------------------------------
// Relay mocks
// ---------------------------------------------------------------------------

/// Candidate with a fixed score.
pub fn candidate(address: &str, score: f64) -> RelayCandidate {
    RelayCandidate {
        address: address.to_string(),
        source_id: "mock".to_string(),
        score,
        uptime: 90.0,
        latency_ms: 100,
        protocol: RelayProtocol::Http,
    }
}

/// Provider returning a fixed list and counting fetches.
#[derive(Clone)]
pub struct MockProvider {
    id: String,
    candidates: Vec<RelayCandidate>,
    fetches: Arc<AtomicUsize>,
}

impl MockProvider {
    pub fn new(id: &str, candidates: Vec<RelayCandidate>) -> Self {
        Self {
            id: id.to_string(),
            candidates,
            fetches: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl RelayProvider for MockProvider {
    fn source_id(&self) -> &str {
        &self.id
    }

    fn fetch_candidates(&self) -> BoxFuture<'_, Vec<RelayCandidate>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let candidates = self.candidates.clone();
        async move { candidates }.boxed()
    }
}

/// Probe with a fixed reachability answer per address.
#[derive(Clone)]
pub struct MockProbe {
    /// `None` means everything is reachable.
    reachable: Option<HashSet<String>>,
    probed: Arc<Mutex<Vec<String>>>,
}

impl MockProbe {
    pub fn reachable(addresses: &[&str]) -> Self {
        Self {
            reachable: Some(addresses.iter().map(|a| a.to_string()).collect()),
            probed: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn all_reachable() -> Self {
        Self {
            reachable: None,
            probed: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn none_reachable() -> Self {
        Self::reachable(&[])
    }

    /// Addresses probed, in call order.
    pub fn probed(&self) -> Vec<String> {
        self.probed.lock().unwrap().clone()
    }
}

impl RelayProbe for MockProbe {
    async fn probe(&self, candidate: &RelayCandidate) -> bool {
        self.probed.lock().unwrap().push(candidate.address.clone());
        match &self.reachable {
            None => true,
            Some(set) => set.contains(&candidate.address),
        }
    }
}

// ---------------------------------------------------------------------------
// RecordingObserver
// ---------------------------------------------------------------------------

/// Observer that keeps every event it receives.
#[derive(Clone, Default)]
pub struct RecordingObserver {
    events: Arc<Mutex<Vec<JobEvent>>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<JobEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Target status of every status change, in order.
    pub fn statuses(&self) -> Vec<JobStatus> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                JobEvent::StatusChange { to, .. } => Some(to),
                _ => None,
            })
            .collect()
    }

    pub fn log_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, JobEvent::Log { .. }))
            .count()
    }
}

impl JobObserver for RecordingObserver {
    fn notify(&self, event: &JobEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}
