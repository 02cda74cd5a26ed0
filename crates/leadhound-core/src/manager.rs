use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::AppError;
use crate::job::JobStatus;
use crate::orchestrator::{JobHandle, JobOrchestrator, JobReport};
use crate::traits::{Collector, Extractor, RelayProbe, ResultStore, SessionFactory};

struct Entry {
    handle: JobHandle,
    task: Option<JoinHandle<JobReport>>,
}

/// Runs orchestrators on the tokio runtime with a bound on how many execute
/// at once. Jobs over the bound wait in `Idle` for a permit.
#[derive(Clone)]
pub struct JobManager {
    permits: Arc<Semaphore>,
    jobs: Arc<Mutex<HashMap<Uuid, Entry>>>,
}

impl JobManager {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn lock_jobs(&self) -> MutexGuard<'_, HashMap<Uuid, Entry>> {
        self.jobs.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Job registry recovered from poisoned mutex");
            poisoned.into_inner()
        })
    }

    pub fn submit<F, C, E, S, P>(&self, orchestrator: JobOrchestrator<F, C, E, S, P>) -> JobHandle
    where
        F: SessionFactory + 'static,
        C: Collector + 'static,
        E: Extractor + 'static,
        S: ResultStore + 'static,
        P: RelayProbe + 'static,
    {
        let handle = orchestrator.handle();
        let job_id = handle.id();
        let permits = Arc::clone(&self.permits);

        let task = tokio::spawn(async move {
            let _permit = permits.acquire_owned().await.ok();
            tracing::debug!(%job_id, "Job acquired a run permit");
            orchestrator.run().await
        });

        self.lock_jobs().insert(
            job_id,
            Entry {
                handle: handle.clone(),
                task: Some(task),
            },
        );
        tracing::info!(%job_id, "Job submitted");
        handle
    }

    pub fn get(&self, job_id: Uuid) -> Option<JobHandle> {
        self.lock_jobs().get(&job_id).map(|e| e.handle.clone())
    }

    pub fn list(&self) -> Vec<JobHandle> {
        self.lock_jobs().values().map(|e| e.handle.clone()).collect()
    }

    /// Jobs not yet in a terminal status.
    pub fn active(&self) -> usize {
        self.lock_jobs()
            .values()
            .filter(|e| !e.handle.status().is_terminal())
            .count()
    }

    pub fn cancel_all(&self) {
        let handles = self.list();
        for handle in &handles {
            handle.cancel();
        }
        tracing::info!(jobs = handles.len(), "Cancellation requested for all jobs");
    }

    /// Wait for a job to finish and return its report. A report can be
    /// awaited once.
    pub async fn wait(&self, job_id: Uuid) -> Result<JobReport, AppError> {
        let task = self
            .lock_jobs()
            .get_mut(&job_id)
            .and_then(|e| e.task.take())
            .ok_or_else(|| AppError::Generic(format!("No pending job {}", job_id)))?;

        task.await
            .map_err(|e| AppError::Generic(format!("Job {} task failed: {}", job_id, e)))
    }

    /// Drop finished jobs from the registry. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let mut jobs = self.lock_jobs();
        let before = jobs.len();
        jobs.retain(|_, e| {
            let finished = e.handle.status().is_terminal()
                && e.task.as_ref().is_none_or(JoinHandle::is_finished);
            !finished
        });
        before - jobs.len()
    }

    pub fn status(&self, job_id: Uuid) -> Option<JobStatus> {
        self.get(job_id).map(|h| h.status())
    }
}
