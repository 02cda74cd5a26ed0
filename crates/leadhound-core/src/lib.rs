pub mod error;
pub mod investigate;
pub mod job;
pub mod manager;
pub mod models;
pub mod observer;
pub mod orchestrator;
pub mod page;
pub mod patterns;
pub mod rate;
pub mod relay;
pub mod traits;
pub mod util;

#[cfg(test)]
pub(crate) mod testutil;

pub use error::{AppError, ErrorKind};
pub use investigate::{CrawlInvestigator, InvestigatorConfig, Traversal};
pub use job::{JobConfig, JobProgress, JobStatus, OrchestratorConfig, SearchParams};
pub use manager::JobManager;
pub use models::{
    FieldSet, InvestigationResult, Lead, LeadField, LogEntry, LogLevel, SessionCookie, WorkUnit,
    compute_hash,
};
pub use observer::{ChannelObserver, JobEvent, JobObserver, NullObserver, TracingJobObserver};
pub use orchestrator::{AuthChallenge, JobHandle, JobOrchestrator, JobReport};
pub use rate::{RateConfig, RateController};
pub use relay::{CachedProvider, RelayCandidate, RelayPool, RelayProtocol, SourceTier};
pub use traits::{
    Collector, Extractor, NullProbe, NullStore, PageSession, RelayProbe, RelayProvider,
    ResultRecord, ResultStore, SessionFactory,
};
