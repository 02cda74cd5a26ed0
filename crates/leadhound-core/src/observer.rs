use tokio::sync::mpsc;
use uuid::Uuid;

use crate::job::{JobProgress, JobStatus};
use crate::models::{Lead, LogEntry, LogLevel};

/// Events emitted by a running job for monitoring and UI forwarding.
#[derive(Debug, Clone)]
pub enum JobEvent {
    Progress {
        job_id: Uuid,
        progress: JobProgress,
    },
    Log {
        job_id: Uuid,
        entry: LogEntry,
    },
    Result {
        job_id: Uuid,
        lead: Lead,
    },
    StatusChange {
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
        message: Option<String>,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> Uuid {
        match self {
            JobEvent::Progress { job_id, .. }
            | JobEvent::Log { job_id, .. }
            | JobEvent::Result { job_id, .. }
            | JobEvent::StatusChange { job_id, .. } => *job_id,
        }
    }
}

/// Receives job events. Fire-and-forget: implementations must not block.
pub trait JobObserver: Send + Sync {
    fn notify(&self, event: &JobEvent) {
        let _ = event;
    }
}

/// Observer that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingJobObserver;

impl JobObserver for TracingJobObserver {
    fn notify(&self, event: &JobEvent) {
        match event {
            JobEvent::Progress { job_id, progress } => {
                tracing::debug!(
                    %job_id,
                    success = progress.success_count,
                    errors = progress.error_count,
                    skipped = progress.skipped_count,
                    queued = progress.queued,
                    target = progress.target,
                    eta_secs = ?progress.eta_secs,
                    "Job progress"
                );
            }
            JobEvent::Log { job_id, entry } => match entry.level {
                LogLevel::Info => tracing::info!(%job_id, "{}", entry.message),
                LogLevel::Warn => tracing::warn!(%job_id, "{}", entry.message),
                LogLevel::Error => tracing::error!(%job_id, "{}", entry.message),
            },
            JobEvent::Result { job_id, .. } => {
                tracing::debug!(%job_id, "Lead extracted");
            }
            JobEvent::StatusChange {
                job_id,
                from,
                to,
                message,
            } => {
                tracing::info!(%job_id, %from, %to, ?message, "Job status changed");
            }
        }
    }
}

/// Observer that forwards every event into an unbounded channel.
///
/// A dropped receiver is not an error; events are discarded.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<JobEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<JobEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl JobObserver for ChannelObserver {
    fn notify(&self, event: &JobEvent) {
        let _ = self.tx.send(event.clone());
    }
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl JobObserver for NullObserver {}
