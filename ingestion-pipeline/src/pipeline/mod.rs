mod config;
mod context;
mod services;
mod stages;
mod state;

pub use config::{IngestionLimits, IngestionTuning};
#[allow(clippy::module_name_repetitions)]
pub use services::{DefaultPipelineServices, PipelineServices};

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        store::StorageManager,
        types::{
            ingest_job::{IngestJob, JobStatus},
            ingest_task::IngestTask,
        },
    },
    utils::{config::AppConfig, embedding::EmbeddingProvider},
};
use tracing::{debug, info, warn};

use crate::github::{
    auth::{CredentialBroker, SystemClock},
    GithubClient,
};

use self::{
    context::RunContext,
    stages::{discover, finalize, process_files, select},
    state::ready,
};

/// How one ingestion run ended from the queue's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Canceled,
}

#[allow(clippy::module_name_repetitions)]
pub struct IngestionPipeline {
    db: Arc<SurrealDbClient>,
    limits: IngestionLimits,
    tuning: IngestionTuning,
    default_tenant: String,
    services: Arc<dyn PipelineServices>,
}

impl IngestionPipeline {
    pub fn new(
        db: Arc<SurrealDbClient>,
        config: &AppConfig,
        storage: StorageManager,
        embedding_provider: Arc<EmbeddingProvider>,
    ) -> Result<Self, AppError> {
        let broker = CredentialBroker::from_config(config, Arc::new(SystemClock))?;
        let github = GithubClient::new(config.github_api_base.clone(), broker)?;
        let services = DefaultPipelineServices::new(github, embedding_provider, storage);

        Ok(Self {
            db,
            limits: IngestionLimits::from(config),
            tuning: IngestionTuning::default(),
            default_tenant: config.default_tenant_id.clone(),
            services: Arc::new(services),
        })
    }

    /// Inject services and limits directly, used by tests.
    pub fn with_services(
        db: Arc<SurrealDbClient>,
        limits: IngestionLimits,
        tuning: IngestionTuning,
        default_tenant: String,
        services: Arc<dyn PipelineServices>,
    ) -> Self {
        Self {
            db,
            limits,
            tuning,
            default_tenant,
            services,
        }
    }

    #[tracing::instrument(
        skip_all,
        fields(
            task_id = %task.id,
            attempt = task.attempts,
            worker_id = task.worker_id.as_deref().unwrap_or("unknown-worker")
        )
    )]
    pub async fn process_task(&self, task: IngestTask) -> Result<(), AppError> {
        let processing_task = task.mark_processing(&self.db).await?;

        if !processing_task.payload.is_ingest() {
            warn!(
                task_id = %processing_task.id,
                task_type = %processing_task.payload.task_type,
                "unknown task type; acknowledging without processing"
            );
            processing_task.mark_succeeded(&self.db).await?;
            return Ok(());
        }

        let last_attempt = !processing_task.can_retry();

        match self
            .drive_job(&processing_task, last_attempt)
            .await
            .map_err(|err| {
                debug!(
                    task_id = %processing_task.id,
                    attempt = processing_task.attempts,
                    error = %err,
                    "ingestion run failed"
                );
                err
            }) {
            Ok(RunOutcome::Completed) => {
                processing_task.mark_succeeded(&self.db).await?;
                info!(
                    task_id = %processing_task.id,
                    attempt = processing_task.attempts,
                    "ingestion task succeeded"
                );
                Ok(())
            }
            Ok(RunOutcome::Canceled) => {
                processing_task.mark_cancelled(&self.db).await?;
                info!(
                    task_id = %processing_task.id,
                    attempt = processing_task.attempts,
                    "ingestion task cancelled"
                );
                Ok(())
            }
            Err(err) => {
                let reason = err.to_string();
                let retryable = err.is_retryable();

                if retryable && processing_task.can_retry() {
                    let delay = self.tuning.retry_delay(processing_task.attempts);
                    processing_task
                        .mark_failed(&reason, delay, &self.db)
                        .await?;
                    warn!(
                        task_id = %processing_task.id,
                        attempt = processing_task.attempts,
                        retry_in_secs = delay.as_secs(),
                        "ingestion task failed; scheduled retry"
                    );
                } else {
                    let failed_task = processing_task
                        .mark_failed(&reason, Duration::from_secs(0), &self.db)
                        .await?;
                    failed_task.mark_dead_letter(&reason, &self.db).await?;
                    warn!(
                        task_id = %failed_task.id,
                        attempt = failed_task.attempts,
                        "ingestion task failed; moved to dead letter queue"
                    );
                }

                Err(AppError::Processing(reason))
            }
        }
    }

    #[tracing::instrument(
        skip_all,
        fields(task_id = %task.id, attempt = task.attempts)
    )]
    async fn drive_job(
        &self,
        task: &IngestTask,
        last_attempt: bool,
    ) -> Result<RunOutcome, AppError> {
        let job = self.resolve_job(task).await?;

        // A cancellation observed before any host traffic settles the job
        // without starting the run.
        match job.status {
            JobStatus::Canceled => return Ok(RunOutcome::Canceled),
            JobStatus::CancelRequested => {
                job.mark_canceled(&self.db).await?;
                return Ok(RunOutcome::Canceled);
            }
            JobStatus::Completed | JobStatus::Failed => {
                return Err(AppError::Processing(format!(
                    "ingest job {} is already settled as {}",
                    job.id,
                    job.status.as_str()
                )));
            }
            JobStatus::Queued | JobStatus::Running => {}
        }

        // A job left running by a lapsed lease or a prior attempt is picked
        // up as-is.
        let job = if job.status == JobStatus::Queued {
            job.mark_running(&self.db).await?
        } else {
            job
        };

        let mut ctx = RunContext::new(
            task.id.clone(),
            task.attempts,
            self.db.as_ref(),
            &self.limits,
            self.services.as_ref(),
            &self.default_tenant,
            job,
        );

        match self.run_stages(&mut ctx).await {
            Ok(()) => Ok(RunOutcome::Completed),
            Err(AppError::Canceled) => Ok(RunOutcome::Canceled),
            Err(err) => {
                if last_attempt || !err.is_retryable() {
                    if let Err(settle_err) = ctx.job.mark_failed(&err.to_string(), self.db.as_ref()).await
                    {
                        warn!(
                            job_id = %ctx.job.id,
                            error = %settle_err,
                            "failed to settle job record after run failure"
                        );
                    }
                } else if let Err(flush_err) = ctx
                    .flush_progress(format!(
                        "Attempt {} failed: {err}; will retry",
                        ctx.attempt
                    ))
                    .await
                {
                    warn!(
                        job_id = %ctx.job.id,
                        error = %flush_err,
                        "failed to flush progress after run failure"
                    );
                }
                Err(err)
            }
        }
    }

    async fn run_stages(&self, ctx: &mut RunContext<'_>) -> Result<(), AppError> {
        let machine = ready();

        let run_started = Instant::now();

        let stage_start = Instant::now();
        let machine = discover(machine, ctx).await.map_err(|err| ctx.abort(err))?;
        let discover_duration = stage_start.elapsed();

        let stage_start = Instant::now();
        let machine = select(machine, ctx).await.map_err(|err| ctx.abort(err))?;
        let select_duration = stage_start.elapsed();

        let stage_start = Instant::now();
        let machine = process_files(machine, ctx)
            .await
            .map_err(|err| ctx.abort(err))?;
        let process_duration = stage_start.elapsed();

        let stage_start = Instant::now();
        let _machine = finalize(machine, ctx).await.map_err(|err| ctx.abort(err))?;
        let finalize_duration = stage_start.elapsed();

        info!(
            task_id = %ctx.task_id,
            attempt = ctx.attempt,
            job_id = %ctx.job.id,
            total_ms = Self::duration_millis(run_started.elapsed()),
            discover_ms = Self::duration_millis(discover_duration),
            select_ms = Self::duration_millis(select_duration),
            process_ms = Self::duration_millis(process_duration),
            finalize_ms = Self::duration_millis(finalize_duration),
            "ingestion run finished"
        );

        Ok(())
    }

    /// The submitting layer normally creates the job alongside the task;
    /// a task carrying no job reference gets one created at run start.
    async fn resolve_job(&self, task: &IngestTask) -> Result<IngestJob, AppError> {
        if let Some(job_id) = task.payload.ingest_job_id.as_deref() {
            if let Some(job) = self.db.get_item::<IngestJob>(job_id).await? {
                return Ok(job);
            }
            warn!(
                task_id = %task.id,
                job_id,
                "task references a missing job record; creating a fresh one"
            );
        }

        IngestJob::create_and_store(
            task.payload.repo_url.clone(),
            task.payload.project_id.clone(),
            task.payload.tenant_id.clone(),
            &self.db,
        )
        .await
    }

    fn duration_millis(duration: Duration) -> u64 {
        u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
mod tests;
