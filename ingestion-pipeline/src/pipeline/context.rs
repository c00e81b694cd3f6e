use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::ingest_job::IngestJob,
    },
};
use tracing::{error, info};

use crate::{github::GitTree, selection::SelectedFile};

use super::{config::IngestionLimits, services::PipelineServices};

/// Mutable run state threaded through the stages of one ingestion run.
pub struct RunContext<'a> {
    pub task_id: String,
    pub attempt: u32,
    pub db: &'a SurrealDbClient,
    pub limits: &'a IngestionLimits,
    pub services: &'a dyn PipelineServices,
    pub job: IngestJob,
    pub default_tenant: &'a str,
    pub repo_url: String,
    pub owner: String,
    pub repo: String,
    pub ref_name: String,
    pub tree: Option<GitTree>,
    pub selected: Vec<SelectedFile>,
    pub total_bytes: u64,
    pub files_processed: u64,
    pub chunks_stored: u64,
}

impl<'a> RunContext<'a> {
    pub fn new(
        task_id: String,
        attempt: u32,
        db: &'a SurrealDbClient,
        limits: &'a IngestionLimits,
        services: &'a dyn PipelineServices,
        default_tenant: &'a str,
        job: IngestJob,
    ) -> Self {
        let repo_url = job.repo_url.clone();
        Self {
            task_id,
            attempt,
            db,
            limits,
            services,
            job,
            default_tenant,
            repo_url,
            owner: String::new(),
            repo: String::new(),
            ref_name: String::new(),
            tree: None,
            selected: Vec::new(),
            total_bytes: 0,
            files_processed: 0,
            chunks_stored: 0,
        }
    }

    pub fn tree(&self) -> Result<&GitTree, AppError> {
        self.tree
            .as_ref()
            .ok_or_else(|| AppError::InternalError("repository tree expected to be available".into()))
    }

    /// Cooperative cancellation poll. When an external actor has flagged the
    /// job, progress so far is flushed, the job is settled as canceled, and
    /// the run unwinds via [`AppError::Canceled`].
    pub async fn check_cancellation(&mut self) -> Result<(), AppError> {
        let Some(status) = IngestJob::current_status(&self.job.id, self.db).await? else {
            return Ok(());
        };

        if !status.is_cancellation() {
            return Ok(());
        }

        self.flush_progress("Cancellation requested; stopping".to_string())
            .await?;
        self.job = self.job.mark_canceled(self.db).await?;

        info!(
            task_id = %self.task_id,
            job_id = %self.job.id,
            files_processed = self.files_processed,
            "ingestion run canceled by request"
        );

        Err(AppError::Canceled)
    }

    pub async fn flush_progress(&self, message: String) -> Result<(), AppError> {
        self.job
            .record_progress(self.files_processed, self.chunks_stored, message, self.db)
            .await
    }

    pub fn abort(&mut self, err: AppError) -> AppError {
        if !matches!(err, AppError::Canceled) {
            error!(
                task_id = %self.task_id,
                attempt = self.attempt,
                job_id = %self.job.id,
                error = %err,
                "ingestion run aborted"
            );
        }
        err
    }
}
