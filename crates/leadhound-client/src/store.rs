use std::path::{Path, PathBuf};

use leadhound_core::error::AppError;
use leadhound_core::traits::{ResultRecord, ResultStore};
use uuid::Uuid;

/// Writes each job's record to `<dir>/<job_id>.json`.
///
/// The file is written to a temporary name and renamed into place, so a
/// reader never sees a half-written record.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, job_id: Uuid) -> PathBuf {
        self.dir.join(format!("{job_id}.json"))
    }

    /// Read a saved record back as JSON.
    pub async fn load(&self, job_id: Uuid) -> Result<Option<serde_json::Value>, AppError> {
        let path = self.path_for(job_id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AppError::Persistence(format!(
                "Failed to read {}: {e}",
                path.display()
            ))),
        }
    }
}

impl ResultStore for JsonFileStore {
    async fn save_results(&self, record: &ResultRecord<'_>) -> Result<String, AppError> {
        let body = serde_json::to_vec_pretty(record)?;
        tokio::fs::create_dir_all(&self.dir).await.map_err(|e| {
            AppError::Persistence(format!("Failed to create {}: {e}", self.dir.display()))
        })?;

        let path = self.path_for(record.job_id);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &body)
            .await
            .map_err(|e| AppError::Persistence(format!("Failed to write {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| AppError::Persistence(format!("Failed to move {}: {e}", path.display())))?;

        tracing::info!(
            job_id = %record.job_id,
            results = record.results.len(),
            path = %path.display(),
            "Results saved"
        );
        Ok(path.display().to_string())
    }
}
