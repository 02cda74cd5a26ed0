//! Per-job execution engine.
//!
//! ```text
//!                 ┌─ producer lane (primary session) ──────────────┐
//!  initialize ────┤    collect pass -> dedup -> enqueue            ├──── finalize
//!  relay|direct   └─ worker lane (secondary session) ──────────────┘   close, persist
//!                      pop -> extract -> required-field filter
//! ```
//!
//! Both lanes run as futures joined inside the job's task and share one
//! mutex-guarded [`JobState`]; the lock is never held across an await.
//! Every checkpoint honours pause (idle-wait) and cancel (unwind), so the
//! job reacts within one poll interval.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{AppError, ErrorKind};
use crate::job::{EtaEstimator, JobConfig, JobProgress, JobStatus, OrchestratorConfig};
use crate::models::{Lead, LogEntry, LogLevel, SessionCookie, WorkUnit, lead_has_field};
use crate::observer::{JobEvent, JobObserver, TracingJobObserver};
use crate::rate::RateController;
use crate::relay::{RelayCandidate, RelayPool};
use crate::traits::{
    Collector, Extractor, NullProbe, PageSession, RelayProbe, ResultRecord, ResultStore,
    SessionFactory,
};

type Credentials = Option<Arc<Vec<SessionCookie>>>;

/// A pending request for interactive credentials.
#[derive(Debug, Clone, Serialize)]
pub struct AuthChallenge {
    /// Page that demanded authentication.
    pub url: String,
    pub reason: String,
    #[serde(skip)]
    pub screenshot: Option<Vec<u8>>,
    pub raised_at: DateTime<Utc>,
}

/// Outcome of a finished job.
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub progress: JobProgress,
    pub results: Vec<Lead>,
    /// Location handle returned by the result store, if results were saved.
    pub location: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Default)]
struct JobState {
    queue: VecDeque<WorkUnit>,
    /// Dedup keys enqueued or completed during this job.
    processed: HashSet<String>,
    in_flight: usize,
    collection_done: bool,
    progress: JobProgress,
    results: Vec<Lead>,
    logs: Vec<LogEntry>,
    relay: Option<RelayCandidate>,
    /// Bumped on every relay change so two lanes hitting the same dead relay
    /// rotate it only once.
    relay_epoch: u64,
    started: Option<Instant>,
}

/// State shared between the orchestrator and its handles.
struct Shared {
    id: Uuid,
    cancel: CancellationToken,
    paused: AtomicBool,
    status: Mutex<JobStatus>,
    state: Mutex<JobState>,
    credentials: watch::Sender<Credentials>,
    challenge: Mutex<Option<AuthChallenge>>,
    observer: Arc<dyn JobObserver>,
}

fn lock<'a, T>(mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("Job state recovered from poisoned mutex");
        poisoned.into_inner()
    })
}

impl Shared {
    fn status(&self) -> JobStatus {
        *lock(&self.status)
    }

    /// Validated transition. Returns false when `to` is not reachable.
    fn transition(&self, to: JobStatus, message: Option<String>) -> bool {
        let from = {
            let mut status = lock(&self.status);
            let from = *status;
            if !from.can_transition_to(to) {
                tracing::debug!(job_id = %self.id, %from, %to, "Ignoring invalid status transition");
                return false;
            }
            *status = to;
            from
        };
        self.observer.notify(&JobEvent::StatusChange {
            job_id: self.id,
            from,
            to,
            message,
        });
        true
    }

    fn transition_from(&self, from: JobStatus, to: JobStatus) -> bool {
        self.status() == from && self.transition(to, None)
    }

    /// Enter a terminal status from whatever non-terminal status is current.
    fn finish(&self, to: JobStatus, message: Option<String>) {
        let from = {
            let mut status = lock(&self.status);
            let from = *status;
            if from.is_terminal() {
                return;
            }
            *status = to;
            from
        };
        self.observer.notify(&JobEvent::StatusChange {
            job_id: self.id,
            from,
            to,
            message,
        });
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        let entry = LogEntry::new(level, message);
        lock(&self.state).logs.push(entry.clone());
        self.observer.notify(&JobEvent::Log {
            job_id: self.id,
            entry,
        });
    }
}

/// Control surface of a submitted job. Cheap to clone.
#[derive(Clone)]
pub struct JobHandle {
    shared: Arc<Shared>,
}

impl JobHandle {
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn status(&self) -> JobStatus {
        self.shared.status()
    }

    pub fn progress(&self) -> JobProgress {
        lock(&self.shared.state).progress.clone()
    }

    pub fn logs(&self) -> Vec<LogEntry> {
        lock(&self.shared.state).logs.clone()
    }

    /// Hold both lanes at their next checkpoint.
    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::SeqCst);
        self.shared.transition_from(JobStatus::Running, JobStatus::Paused);
    }

    pub fn resume(&self) {
        self.shared.paused.store(false, Ordering::SeqCst);
        self.shared.transition_from(JobStatus::Paused, JobStatus::Running);
    }

    /// Request cancellation. Partial results are persisted.
    pub fn cancel(&self) {
        self.shared.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Pending credential request, if the job is paused for authentication.
    pub fn auth_challenge(&self) -> Option<AuthChallenge> {
        lock(&self.shared.challenge).clone()
    }

    /// Hand cookies to a job waiting in `PausedForAuth`.
    pub fn supply_credentials(&self, cookies: Vec<SessionCookie>) -> Result<(), AppError> {
        if self.status() != JobStatus::PausedForAuth {
            return Err(AppError::Generic(format!(
                "Job {} is not waiting for credentials",
                self.shared.id
            )));
        }
        self.shared.credentials.send_replace(Some(Arc::new(cookies)));
        Ok(())
    }
}

/// Per-lane bookkeeping.
struct Lane {
    name: &'static str,
    credentials: watch::Receiver<Credentials>,
    /// Relay epoch this lane's session was opened under.
    epoch: u64,
}

enum PassPlan {
    Collect(usize),
    Wait,
    Done,
}

enum NextUnit {
    Work(WorkUnit),
    Idle,
    Finished,
}

/// Runs one job: relay acquisition, producer/worker lanes, failure routing
/// and persistence.
pub struct JobOrchestrator<F, C, E, S, P: RelayProbe = NullProbe> {
    job: JobConfig,
    config: OrchestratorConfig,
    factory: F,
    collector: C,
    extractor: E,
    store: S,
    pool: Option<RelayPool<P>>,
    /// Shared by both lanes; follows the relay/direct mode of the job.
    rate: RateController,
    shared: Arc<Shared>,
    /// Child of the user's cancel token; also fired when a lane fails fatally.
    stop: CancellationToken,
    eta: EtaEstimator,
}

impl<F, C, E, S> JobOrchestrator<F, C, E, S, NullProbe>
where
    F: SessionFactory,
    C: Collector,
    E: Extractor,
    S: ResultStore,
{
    pub fn new(
        job: JobConfig,
        config: OrchestratorConfig,
        factory: F,
        collector: C,
        extractor: E,
        store: S,
    ) -> Self {
        let cancel = CancellationToken::new();
        let stop = cancel.child_token();
        let (credentials, _) = watch::channel(None);
        let shared = Arc::new(Shared {
            id: Uuid::new_v4(),
            cancel,
            paused: AtomicBool::new(false),
            status: Mutex::new(JobStatus::Idle),
            state: Mutex::new(JobState {
                progress: JobProgress::new(job.target),
                ..Default::default()
            }),
            credentials,
            challenge: Mutex::new(None),
            observer: Arc::new(TracingJobObserver),
        });
        let eta = EtaEstimator::new(config.initial_item_estimate);
        let rate = RateController::new(config.direct_rate.clone());
        Self {
            job,
            config,
            factory,
            collector,
            extractor,
            store,
            pool: None,
            rate,
            shared,
            stop,
            eta,
        }
    }
}

impl<F, C, E, S, P> JobOrchestrator<F, C, E, S, P>
where
    F: SessionFactory,
    C: Collector,
    E: Extractor,
    S: ResultStore,
    P: RelayProbe,
{
    /// Route the job through relays drawn from `pool`.
    pub fn with_relay_pool<Q: RelayProbe>(self, pool: RelayPool<Q>) -> JobOrchestrator<F, C, E, S, Q> {
        JobOrchestrator {
            job: self.job,
            config: self.config,
            factory: self.factory,
            collector: self.collector,
            extractor: self.extractor,
            store: self.store,
            pool: Some(pool),
            rate: self.rate,
            shared: self.shared,
            stop: self.stop,
            eta: self.eta,
        }
    }

    /// Replace the default tracing observer. Must be called before any
    /// handle is taken.
    pub fn with_observer(mut self, observer: Arc<dyn JobObserver>) -> Self {
        match Arc::get_mut(&mut self.shared) {
            Some(shared) => shared.observer = observer,
            None => tracing::warn!(
                job_id = %self.shared.id,
                "Observer ignored: job handles already exist"
            ),
        }
        self
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn config(&self) -> &JobConfig {
        &self.job
    }

    pub fn handle(&self) -> JobHandle {
        JobHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Drive the job to a terminal status.
    pub async fn run(self) -> JobReport {
        tracing::info!(
            job_id = %self.shared.id,
            query = %self.job.params.query,
            target = self.job.target,
            use_relays = self.job.use_relays,
            "Job starting"
        );
        self.shared.transition(JobStatus::Initializing, None);

        let (primary, secondary) = match self.initialize().await {
            Ok(pair) => pair,
            Err(e) => return self.finalize(Some(e)).await,
        };

        let relay = self.with_state(|st| {
            st.started = Some(Instant::now());
            st.relay.clone()
        });
        if relay.is_some() {
            self.rate.reconfigure(self.config.relayed_rate.clone());
        }
        self.shared.transition(JobStatus::Running, None);
        if self.shared.paused.load(Ordering::SeqCst) {
            self.shared.transition(JobStatus::Paused, None);
        }
        match &relay {
            Some(r) => self.log(LogLevel::Info, format!("Running through relay {}", r.address)),
            None => self.log(LogLevel::Info, "Running in direct mode"),
        }
        self.emit_progress();

        let ((primary, produced), (secondary, worked)) = tokio::join!(
            self.producer_lane(primary, &self.rate),
            self.worker_lane(secondary, &self.rate),
        );

        if let Some(session) = primary {
            session.close().await;
        }
        if let Some(session) = secondary {
            session.close().await;
        }

        let error = [produced, worked]
            .into_iter()
            .filter_map(Result::err)
            .find(|e| !e.is_cancelled());
        self.finalize(error).await
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut JobState) -> T) -> T {
        let mut state = lock(&self.shared.state);
        f(&mut state)
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.shared.log(level, message);
    }

    fn emit_progress(&self) {
        let progress = self.with_state(|st| {
            let elapsed = st.started.map(|s| s.elapsed()).unwrap_or_default();
            st.progress.queued = st.queue.len();
            st.progress.refresh(&self.eta, elapsed);
            st.progress.clone()
        });
        self.shared.observer.notify(&JobEvent::Progress {
            job_id: self.shared.id,
            progress,
        });
    }

    fn check_stop(&self) -> Result<(), AppError> {
        if self.stop.is_cancelled() {
            Err(AppError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Cancel-aware sleep.
    async fn sleep(&self, duration: Duration) -> Result<(), AppError> {
        if duration.is_zero() {
            return self.check_stop();
        }
        tokio::select! {
            biased;
            _ = self.stop.cancelled() => Err(AppError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    /// Run `fut` under its own timeout; cancellation wins any race.
    async fn bounded<T>(
        &self,
        limit: Duration,
        what: &str,
        fut: impl Future<Output = Result<T, AppError>>,
    ) -> Result<T, AppError> {
        tokio::select! {
            biased;
            _ = self.stop.cancelled() => Err(AppError::Cancelled),
            result = tokio::time::timeout(limit, fut) => result.unwrap_or_else(|_| {
                Err(AppError::Timeout(format!("{} exceeded {:?}", what, limit)))
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Initialization and relay rotation
    // -----------------------------------------------------------------------

    async fn initialize(&self) -> Result<(F::Session, F::Session), AppError> {
        self.check_stop()?;
        if !self.job.use_relays {
            return self.open_pair(None).await;
        }
        let Some(pool) = &self.pool else {
            return Err(AppError::ConfigError(
                "Relay mode requested but no relay pool configured".into(),
            ));
        };

        pool.refresh().await;
        let attempts = self.config.init_relay_attempts;
        for attempt in 1..=attempts {
            self.check_stop()?;
            let Some(relay) = pool.acquire(self.job.allow_direct).await? else {
                break;
            };
            match self.open_pair(Some(&relay)).await {
                Ok(pair) => {
                    self.with_state(|st| st.relay = Some(relay));
                    return Ok(pair);
                }
                Err(e) if e.is_connectivity() => {
                    pool.mark_failed(&relay);
                    self.log(
                        LogLevel::Warn,
                        format!(
                            "Relay {} failed to open a session (attempt {}/{}): {}",
                            relay.address, attempt, attempts, e
                        ),
                    );
                }
                Err(e) => return Err(e),
            }
        }

        if !self.job.allow_direct {
            return Err(AppError::PoolExhausted);
        }
        self.log(LogLevel::Warn, "No working relay, falling back to direct mode");
        self.open_pair(None).await
    }

    async fn open_pair(
        &self,
        relay: Option<&RelayCandidate>,
    ) -> Result<(F::Session, F::Session), AppError> {
        let primary = self.factory.open(relay).await?;
        let secondary = match self.factory.open(relay).await {
            Ok(session) => session,
            Err(e) => {
                primary.close().await;
                return Err(e);
            }
        };
        if self.stop.is_cancelled() {
            primary.close().await;
            secondary.close().await;
            return Err(AppError::Cancelled);
        }
        Ok((primary, secondary))
    }

    /// Relay a lane should reopen on. Rotates the shared relay unless the
    /// other lane already did so since this lane's session was opened.
    async fn rotate_relay(&self, lane: &mut Lane) -> Result<Option<RelayCandidate>, AppError> {
        let (epoch, current) = self.with_state(|st| (st.relay_epoch, st.relay.clone()));
        if epoch != lane.epoch {
            lane.epoch = epoch;
            return Ok(current);
        }
        let Some(pool) = self.pool.as_ref().filter(|_| self.job.use_relays) else {
            return Ok(current);
        };

        if let Some(relay) = &current {
            pool.mark_failed(relay);
        }
        let next = pool.acquire(self.job.allow_direct).await?;
        let (epoch, relay) = self.with_state(|st| {
            if st.relay_epoch == epoch {
                st.relay = next;
                st.relay_epoch += 1;
            }
            (st.relay_epoch, st.relay.clone())
        });
        lane.epoch = epoch;
        if relay.is_some() != current.is_some() {
            self.switch_rate(relay.is_some());
        }

        match &relay {
            Some(r) => self.log(LogLevel::Info, format!("Rotated to relay {}", r.address)),
            None => self.log(LogLevel::Warn, "Relay pool exhausted, continuing in direct mode"),
        }
        Ok(relay)
    }

    async fn reconnect(&self, lane: &mut Lane) -> Result<F::Session, AppError> {
        for _ in 0..self.config.init_relay_attempts.max(1) {
            self.check_stop()?;
            let relay = self.rotate_relay(lane).await?;
            match self.factory.open(relay.as_ref()).await {
                Ok(session) => return Ok(session),
                Err(e) if e.is_connectivity() && relay.is_some() => {
                    tracing::debug!(lane = lane.name, error = %e, "Reopen through relay failed");
                }
                Err(e) => return Err(e),
            }
        }

        if !self.job.allow_direct {
            return Err(AppError::PoolExhausted);
        }
        self.log(
            LogLevel::Warn,
            format!("{} lane falling back to direct mode", lane.name),
        );
        let (epoch, was_relayed) = self.with_state(|st| {
            let was_relayed = st.relay.take().is_some();
            st.relay_epoch += 1;
            (st.relay_epoch, was_relayed)
        });
        lane.epoch = epoch;
        if was_relayed {
            self.switch_rate(false);
        }
        self.factory.open(None).await
    }

    /// Move the shared delay onto the preset of the new mode.
    fn switch_rate(&self, relayed: bool) {
        let (preset, mode) = if relayed {
            (self.config.relayed_rate.clone(), "relayed")
        } else {
            (self.config.direct_rate.clone(), "direct")
        };
        tracing::debug!(job_id = %self.shared.id, mode, "Switching delay preset");
        self.rate.reconfigure(preset);
    }

    async fn handle_connectivity(
        &self,
        session: &mut Option<F::Session>,
        lane: &mut Lane,
        error: &AppError,
    ) -> Result<(), AppError> {
        self.with_state(|st| st.progress.rotations += 1);
        self.log(
            LogLevel::Warn,
            format!("{} lane lost connectivity: {}", lane.name, error),
        );
        if let Some(old) = session.take() {
            old.close().await;
        }
        *session = Some(self.reconnect(lane).await?);
        self.emit_progress();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Checkpoints and credentials
    // -----------------------------------------------------------------------

    async fn checkpoint(
        &self,
        session: &mut Option<F::Session>,
        lane: &mut Lane,
    ) -> Result<(), AppError> {
        loop {
            self.check_stop()?;
            let held = self.shared.paused.load(Ordering::SeqCst)
                || self.shared.status() == JobStatus::PausedForAuth;
            if !held {
                break;
            }
            self.sleep(self.config.poll_interval).await?;
        }

        // Credentials supplied while the other lane waited for them.
        if lane.credentials.has_changed().unwrap_or(false) {
            let cookies = lane.credentials.borrow_and_update().clone();
            if let Some(cookies) = cookies {
                self.apply_credentials(session, lane, &cookies).await?;
            }
        }
        Ok(())
    }

    /// Install cookies on the lane's session. A dead session is replaced
    /// and gets one more attempt; any other failure is logged and the lane
    /// carries on without them.
    async fn apply_credentials(
        &self,
        session: &mut Option<F::Session>,
        lane: &mut Lane,
        cookies: &[SessionCookie],
    ) -> Result<(), AppError> {
        let Some(current) = session.as_ref() else {
            return Ok(());
        };
        let error = match current.set_cookies(cookies).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => e,
        };
        if !error.is_connectivity() {
            self.log(
                LogLevel::Warn,
                format!("{} lane could not apply credentials: {}", lane.name, error),
            );
            return Ok(());
        }

        self.rate.record_error();
        self.handle_connectivity(session, lane, &error).await?;
        if let Some(fresh) = session.as_ref()
            && let Err(e) = fresh.set_cookies(cookies).await
        {
            if e.is_cancelled() {
                return Err(e);
            }
            self.log(
                LogLevel::Warn,
                format!(
                    "{} lane continues without credentials after reconnect: {}",
                    lane.name, e
                ),
            );
        }
        Ok(())
    }

    async fn await_credentials(
        &self,
        session: &mut Option<F::Session>,
        lane: &mut Lane,
        error: &AppError,
    ) -> Result<(), AppError> {
        let (url, screenshot) = match session.as_ref() {
            Some(s) => (s.current_url().await.unwrap_or_default(), s.screenshot().await),
            None => (String::new(), None),
        };
        *lock(&self.shared.challenge) = Some(AuthChallenge {
            url,
            reason: error.to_string(),
            screenshot,
            raised_at: Utc::now(),
        });
        self.shared
            .transition(JobStatus::PausedForAuth, Some(error.to_string()));
        self.log(
            LogLevel::Warn,
            format!(
                "Waiting up to {:?} for credentials: {}",
                self.config.auth_timeout, error
            ),
        );

        let limit = self.config.auth_timeout;
        let waited = tokio::select! {
            biased;
            _ = self.stop.cancelled() => Err(AppError::Cancelled),
            changed = tokio::time::timeout(limit, lane.credentials.changed()) => match changed {
                Ok(Ok(())) => Ok(()),
                Ok(Err(_)) => Err(AppError::Generic("Credential channel closed".into())),
                Err(_) => Err(AppError::AuthRequired(format!(
                    "no credentials supplied within {:?}",
                    limit
                ))),
            },
        };
        *lock(&self.shared.challenge) = None;
        waited?;

        let cookies = lane.credentials.borrow_and_update().clone();
        if let Some(cookies) = cookies {
            self.apply_credentials(session, lane, &cookies).await?;
        }
        if self
            .shared
            .transition_from(JobStatus::PausedForAuth, JobStatus::Running)
            && self.shared.paused.load(Ordering::SeqCst)
        {
            self.shared.transition(JobStatus::Paused, None);
        }
        self.log(LogLevel::Info, "Credentials received, resuming");
        Ok(())
    }

    fn new_lane(&self, name: &'static str) -> Lane {
        Lane {
            name,
            credentials: self.shared.credentials.subscribe(),
            epoch: self.with_state(|st| st.relay_epoch),
        }
    }

    fn count_error(&self, message: String) {
        self.with_state(|st| st.progress.error_count += 1);
        self.log(LogLevel::Warn, message);
    }

    // -----------------------------------------------------------------------
    // Producer lane
    // -----------------------------------------------------------------------

    async fn producer_lane(
        &self,
        session: F::Session,
        rate: &RateController,
    ) -> (Option<F::Session>, Result<(), AppError>) {
        let mut session = Some(session);
        let result = self.produce(&mut session, rate).await;
        self.with_state(|st| st.collection_done = true);
        if let Err(e) = &result
            && !e.is_cancelled()
        {
            self.stop.cancel();
        }
        (session, result)
    }

    fn plan_pass(&self, pass: u32) -> PassPlan {
        let target = self.job.target;
        let max_passes = self.config.max_collection_passes;
        self.with_state(|st| {
            if st.progress.success_count >= target {
                return PassPlan::Done;
            }
            if pass >= max_passes {
                tracing::debug!(job_id = %self.shared.id, pass, "Collection pass limit reached");
                return PassPlan::Done;
            }
            let reachable = st.progress.success_count + st.queue.len() + st.in_flight;
            if pass > 0 && reachable >= target {
                return PassPlan::Wait;
            }
            PassPlan::Collect(self.config.collection_quota(target.saturating_sub(reachable)))
        })
    }

    /// Enqueue unseen units, at most `cap`. Returns how many were added.
    fn enqueue(&self, units: Vec<WorkUnit>, cap: usize) -> usize {
        self.with_state(|st| {
            let mut added = 0;
            for unit in units {
                if added >= cap {
                    break;
                }
                if st.processed.insert(unit.dedup_key.clone()) {
                    st.queue.push_back(unit);
                    added += 1;
                }
            }
            st.progress.total += added;
            st.progress.queued = st.queue.len();
            added
        })
    }

    async fn produce(
        &self,
        session: &mut Option<F::Session>,
        rate: &RateController,
    ) -> Result<(), AppError> {
        let mut lane = self.new_lane("producer");
        let mut pass: u32 = 0;
        let mut retries = 0;

        loop {
            self.checkpoint(session, &mut lane).await?;
            let wanted = match self.plan_pass(pass) {
                PassPlan::Collect(wanted) => wanted,
                PassPlan::Wait => {
                    self.sleep(self.config.poll_interval).await?;
                    continue;
                }
                PassPlan::Done => return Ok(()),
            };

            self.sleep(rate.next_delay()).await?;
            let collected = {
                let current = session
                    .as_ref()
                    .ok_or_else(|| AppError::Generic("Producer session lost".into()))?;
                self.bounded(
                    self.config.collection_timeout,
                    "collection pass",
                    self.collector
                        .collect(current, &self.job.params, pass, wanted),
                )
                .await
            };

            match collected {
                Ok(units) => {
                    rate.record_success();
                    retries = 0;
                    pass += 1;
                    let added = self.enqueue(units, wanted);
                    self.log(
                        LogLevel::Info,
                        format!("Collection pass {} queued {} new units", pass, added),
                    );
                    self.emit_progress();
                    if added == 0 {
                        self.log(LogLevel::Info, "Collection exhausted: pass yielded nothing new");
                        return Ok(());
                    }
                }
                Err(e) => match e.kind() {
                    ErrorKind::Connectivity => {
                        rate.record_error();
                        self.handle_connectivity(session, &mut lane, &e).await?;
                        retries += 1;
                        if retries > self.config.max_unit_retries {
                            self.count_error(format!(
                                "Collection pass {} abandoned after {} rotations: {}",
                                pass + 1,
                                retries,
                                e
                            ));
                            retries = 0;
                            pass += 1;
                        }
                    }
                    ErrorKind::AuthRequired => {
                        self.await_credentials(session, &mut lane, &e).await?;
                    }
                    ErrorKind::Timeout | ErrorKind::Extraction | ErrorKind::Fatal => {
                        self.count_error(format!("Collection pass {} failed: {}", pass + 1, e));
                        pass += 1;
                    }
                    ErrorKind::Cancelled | ErrorKind::PoolExhausted => return Err(e),
                },
            }
        }
    }

    // -----------------------------------------------------------------------
    // Worker lane
    // -----------------------------------------------------------------------

    async fn worker_lane(
        &self,
        session: F::Session,
        rate: &RateController,
    ) -> (Option<F::Session>, Result<(), AppError>) {
        let mut session = Some(session);
        let result = self.work(&mut session, rate).await;
        if let Err(e) = &result
            && !e.is_cancelled()
        {
            self.stop.cancel();
        }
        (session, result)
    }

    fn next_unit(&self) -> NextUnit {
        let target = self.job.target;
        self.with_state(|st| {
            if st.progress.success_count >= target {
                if !st.queue.is_empty() {
                    tracing::debug!(
                        job_id = %self.shared.id,
                        drained = st.queue.len(),
                        "Target reached, draining queue"
                    );
                    st.queue.clear();
                    st.progress.queued = 0;
                }
                return NextUnit::Finished;
            }
            match st.queue.pop_front() {
                Some(unit) => {
                    st.in_flight += 1;
                    st.progress.current += 1;
                    st.progress.queued = st.queue.len();
                    NextUnit::Work(unit)
                }
                None if st.collection_done => NextUnit::Finished,
                None => NextUnit::Idle,
            }
        })
    }

    async fn work(
        &self,
        session: &mut Option<F::Session>,
        rate: &RateController,
    ) -> Result<(), AppError> {
        let mut lane = self.new_lane("worker");
        loop {
            self.checkpoint(session, &mut lane).await?;
            let unit = match self.next_unit() {
                NextUnit::Work(unit) => unit,
                NextUnit::Idle => {
                    self.sleep(self.config.poll_interval).await?;
                    continue;
                }
                NextUnit::Finished => return Ok(()),
            };

            let outcome = self.process_unit(session, &mut lane, rate, &unit).await;
            self.with_state(|st| st.in_flight = st.in_flight.saturating_sub(1));
            self.emit_progress();
            outcome?;
        }
    }

    async fn process_unit(
        &self,
        session: &mut Option<F::Session>,
        lane: &mut Lane,
        rate: &RateController,
        unit: &WorkUnit,
    ) -> Result<(), AppError> {
        let mut retries = 0;
        loop {
            self.sleep(rate.next_delay()).await?;
            let extracted = {
                let current = session
                    .as_ref()
                    .ok_or_else(|| AppError::Generic("Worker session lost".into()))?;
                self.bounded(
                    self.config.extraction_timeout,
                    "extraction",
                    self.extractor.extract(current, unit),
                )
                .await
            };

            match extracted {
                Ok(lead) => {
                    rate.record_success();
                    self.record_lead(unit, lead);
                    return Ok(());
                }
                Err(e) => match e.kind() {
                    ErrorKind::Connectivity => {
                        rate.record_error();
                        self.handle_connectivity(session, lane, &e).await?;
                        retries += 1;
                        if retries > self.config.max_unit_retries {
                            self.count_error(format!(
                                "Giving up on {} after {} rotations: {}",
                                unit.target, retries, e
                            ));
                            return Ok(());
                        }
                    }
                    ErrorKind::AuthRequired => {
                        self.await_credentials(session, lane, &e).await?;
                    }
                    ErrorKind::Timeout | ErrorKind::Extraction | ErrorKind::Fatal => {
                        self.count_error(format!("Extraction failed for {}: {}", unit.target, e));
                        return Ok(());
                    }
                    ErrorKind::Cancelled | ErrorKind::PoolExhausted => return Err(e),
                },
            }
        }
    }

    fn record_lead(&self, unit: &WorkUnit, lead: Lead) {
        let missing: Vec<&str> = self
            .job
            .required_fields
            .iter()
            .filter(|field| !lead_has_field(&lead, field))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            self.with_state(|st| st.progress.skipped_count += 1);
            self.log(
                LogLevel::Info,
                format!("Skipped {}: missing {}", unit.target, missing.join(", ")),
            );
            return;
        }

        self.with_state(|st| {
            st.results.push(lead.clone());
            st.progress.success_count += 1;
        });
        self.shared.observer.notify(&JobEvent::Result {
            job_id: self.shared.id,
            lead,
        });
    }

    // -----------------------------------------------------------------------
    // Finalization
    // -----------------------------------------------------------------------

    /// Release the relay, persist once and enter the terminal status.
    async fn finalize(&self, error: Option<AppError>) -> JobReport {
        let job_id = self.shared.id;
        if let Some(relay) = self.with_state(|st| st.relay.take()) {
            tracing::debug!(%job_id, relay = %relay.address, "Relay released");
        }

        let mut status = if self.shared.cancel.is_cancelled() {
            JobStatus::Cancelled
        } else if error.is_some() {
            JobStatus::Failed
        } else {
            JobStatus::Completed
        };
        let mut message = match (&error, status) {
            (Some(e), JobStatus::Failed) => {
                self.log(LogLevel::Error, format!("Job failed: {}", e));
                Some(e.to_string())
            }
            _ => None,
        };

        let (progress, results, logs) = self.with_state(|st| {
            st.queue.clear();
            let elapsed = st.started.map(|s| s.elapsed()).unwrap_or_default();
            st.progress.queued = 0;
            st.progress.refresh(&self.eta, elapsed);
            (st.progress.clone(), st.results.clone(), st.logs.clone())
        });

        let mut location = None;
        if status == JobStatus::Completed || !results.is_empty() {
            let record = ResultRecord {
                job_id,
                status,
                config: &self.job,
                progress: &progress,
                logs: &logs,
                results: &results,
            };
            match self.store.save_results(&record).await {
                Ok(saved) => {
                    self.log(
                        LogLevel::Info,
                        format!("Saved {} results to {}", results.len(), saved),
                    );
                    location = Some(saved).filter(|s| !s.is_empty());
                }
                Err(e) => {
                    self.log(LogLevel::Error, format!("Failed to save results: {}", e));
                    message = Some(e.to_string());
                    if status == JobStatus::Completed {
                        status = JobStatus::Failed;
                    }
                }
            }
        }

        self.shared.finish(status, message.clone());
        self.shared.observer.notify(&JobEvent::Progress {
            job_id,
            progress: progress.clone(),
        });
        tracing::info!(
            %job_id,
            %status,
            success = progress.success_count,
            errors = progress.error_count,
            skipped = progress.skipped_count,
            rotations = progress.rotations,
            "Job finished"
        );

        JobReport {
            job_id,
            status,
            progress,
            results,
            location,
            error: message,
        }
    }
}
