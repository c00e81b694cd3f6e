use state_machines::state_machine;
use surrealdb::sql::Datetime as SurrealDatetime;
use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

pub const CANCELED_MESSAGE: &str = "Canceled by request";

#[derive(Debug, Default, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Queued,
    Running,
    Completed,
    Failed,
    Canceled,
    CancelRequested,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
            JobStatus::CancelRequested => "cancel_requested",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Canceled
        )
    }

    /// `cancel_requested` is set by an outside actor and treated as
    /// canceled the next time the pipeline observes it.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, JobStatus::Canceled | JobStatus::CancelRequested)
    }
}

#[derive(Debug, Clone, Copy)]
enum JobTransition {
    Start,
    Complete,
    Fail,
    RequestCancel,
    Cancel,
}

impl JobTransition {
    fn as_str(&self) -> &'static str {
        match self {
            JobTransition::Start => "start",
            JobTransition::Complete => "complete",
            JobTransition::Fail => "fail",
            JobTransition::RequestCancel => "request_cancel",
            JobTransition::Cancel => "cancel",
        }
    }
}

mod lifecycle {
    use super::state_machine;

    state_machine! {
        name: JobLifecycleMachine,
        initial: Queued,
        states: [Queued, Running, Completed, Failed, Canceled, CancelRequested],
        events {
            start {
                transition: { from: Queued, to: Running }
            }
            complete {
                transition: { from: Running, to: Completed }
            }
            fail {
                transition: { from: Queued, to: Failed }
                transition: { from: Running, to: Failed }
                transition: { from: CancelRequested, to: Failed }
            }
            request_cancel {
                transition: { from: Queued, to: CancelRequested }
                transition: { from: Running, to: CancelRequested }
            }
            cancel {
                transition: { from: Queued, to: Canceled }
                transition: { from: Running, to: Canceled }
                transition: { from: CancelRequested, to: Canceled }
            }
        }
    }

    pub(super) fn queued() -> JobLifecycleMachine<(), Queued> {
        JobLifecycleMachine::new(())
    }

    pub(super) fn running() -> JobLifecycleMachine<(), Running> {
        queued()
            .start()
            .expect("start transition from Queued should exist")
    }

    pub(super) fn cancel_requested() -> JobLifecycleMachine<(), CancelRequested> {
        queued()
            .request_cancel()
            .expect("request_cancel transition from Queued should exist")
    }
}

fn invalid_transition(status: &JobStatus, event: JobTransition) -> AppError {
    AppError::Validation(format!(
        "Invalid job transition: {} -> {}",
        status.as_str(),
        event.as_str()
    ))
}

fn compute_next_status(status: &JobStatus, event: JobTransition) -> Result<JobStatus, AppError> {
    use lifecycle::*;
    match (status, event) {
        (JobStatus::Queued, JobTransition::Start) => queued()
            .start()
            .map(|_| JobStatus::Running)
            .map_err(|_| invalid_transition(status, event)),
        (JobStatus::Running, JobTransition::Complete) => running()
            .complete()
            .map(|_| JobStatus::Completed)
            .map_err(|_| invalid_transition(status, event)),
        (JobStatus::Queued, JobTransition::Fail) => queued()
            .fail()
            .map(|_| JobStatus::Failed)
            .map_err(|_| invalid_transition(status, event)),
        (JobStatus::Running, JobTransition::Fail) => running()
            .fail()
            .map(|_| JobStatus::Failed)
            .map_err(|_| invalid_transition(status, event)),
        (JobStatus::CancelRequested, JobTransition::Fail) => cancel_requested()
            .fail()
            .map(|_| JobStatus::Failed)
            .map_err(|_| invalid_transition(status, event)),
        (JobStatus::Queued, JobTransition::RequestCancel) => queued()
            .request_cancel()
            .map(|_| JobStatus::CancelRequested)
            .map_err(|_| invalid_transition(status, event)),
        (JobStatus::Running, JobTransition::RequestCancel) => running()
            .request_cancel()
            .map(|_| JobStatus::CancelRequested)
            .map_err(|_| invalid_transition(status, event)),
        (JobStatus::Queued, JobTransition::Cancel) => queued()
            .cancel()
            .map(|_| JobStatus::Canceled)
            .map_err(|_| invalid_transition(status, event)),
        (JobStatus::Running, JobTransition::Cancel) => running()
            .cancel()
            .map(|_| JobStatus::Canceled)
            .map_err(|_| invalid_transition(status, event)),
        (JobStatus::CancelRequested, JobTransition::Cancel) => cancel_requested()
            .cancel()
            .map(|_| JobStatus::Canceled)
            .map_err(|_| invalid_transition(status, event)),
        _ => Err(invalid_transition(status, event)),
    }
}

stored_object!(IngestJob, "ingest_job", {
    repo_url: String,
    project_id: Option<String>,
    tenant_id: Option<String>,
    status: JobStatus,
    total_files: u64,
    total_bytes: u64,
    files_processed: u64,
    chunks_stored: u64,
    last_message: Option<String>,
    error: Option<String>,
    #[serde(
        serialize_with = "serialize_option_datetime",
        deserialize_with = "deserialize_option_datetime",
        default
    )]
    started_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(
        serialize_with = "serialize_option_datetime",
        deserialize_with = "deserialize_option_datetime",
        default
    )]
    finished_at: Option<chrono::DateTime<chrono::Utc>>
});

impl IngestJob {
    pub fn new(repo_url: String, project_id: Option<String>, tenant_id: Option<String>) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            repo_url,
            project_id,
            tenant_id,
            status: JobStatus::Queued,
            total_files: 0,
            total_bytes: 0,
            files_processed: 0,
            chunks_stored: 0,
            last_message: None,
            error: None,
            started_at: None,
            finished_at: None,
        }
    }

    pub async fn create_and_store(
        repo_url: String,
        project_id: Option<String>,
        tenant_id: Option<String>,
        db: &SurrealDbClient,
    ) -> Result<IngestJob, AppError> {
        let job = Self::new(repo_url, project_id, tenant_id);
        db.store_item(job.clone()).await?;
        Ok(job)
    }

    /// Lightweight status read, used for the cooperative cancellation polls.
    pub async fn current_status(
        id: &str,
        db: &SurrealDbClient,
    ) -> Result<Option<JobStatus>, AppError> {
        let mut result = db
            .query("SELECT VALUE status FROM type::thing($table, $id)")
            .bind(("table", Self::table_name()))
            .bind(("id", id.to_string()))
            .await?;

        let statuses: Vec<JobStatus> = result.take(0)?;
        Ok(statuses.into_iter().next())
    }

    pub async fn mark_running(&self, db: &SurrealDbClient) -> Result<IngestJob, AppError> {
        let next = compute_next_status(&self.status, JobTransition::Start)?;
        debug_assert_eq!(next, JobStatus::Running);

        const START_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            SET status = $running,
                started_at = $now,
                error = NONE,
                updated_at = $now
            WHERE status = $queued
            RETURN *;
        "#;

        let now = chrono::Utc::now();
        let mut result = db
            .query(START_QUERY)
            .bind(("table", Self::table_name()))
            .bind(("id", self.id.clone()))
            .bind(("running", JobStatus::Running.as_str()))
            .bind(("queued", JobStatus::Queued.as_str()))
            .bind(("now", SurrealDatetime::from(now)))
            .await?;

        let updated: Option<IngestJob> = result.take(0)?;
        updated.ok_or_else(|| invalid_transition(&self.status, JobTransition::Start))
    }

    /// Stamps the selection totals once the tree walk has settled.
    pub async fn record_totals(
        &self,
        total_files: u64,
        total_bytes: u64,
        message: String,
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        const TOTALS_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            SET total_files = $total_files,
                total_bytes = $total_bytes,
                last_message = $message,
                updated_at = $now
            RETURN NONE;
        "#;

        db.query(TOTALS_QUERY)
            .bind(("table", Self::table_name()))
            .bind(("id", self.id.clone()))
            .bind(("total_files", total_files))
            .bind(("total_bytes", total_bytes))
            .bind(("message", message))
            .bind(("now", SurrealDatetime::from(chrono::Utc::now())))
            .await?;

        Ok(())
    }

    /// Periodic progress flush. Always stamps `updated_at`.
    pub async fn record_progress(
        &self,
        files_processed: u64,
        chunks_stored: u64,
        message: String,
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        const PROGRESS_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            SET files_processed = $files_processed,
                chunks_stored = $chunks_stored,
                last_message = $message,
                updated_at = $now
            RETURN NONE;
        "#;

        db.query(PROGRESS_QUERY)
            .bind(("table", Self::table_name()))
            .bind(("id", self.id.clone()))
            .bind(("files_processed", files_processed))
            .bind(("chunks_stored", chunks_stored))
            .bind(("message", message))
            .bind(("now", SurrealDatetime::from(chrono::Utc::now())))
            .await?;

        Ok(())
    }

    pub async fn mark_completed(
        &self,
        files_processed: u64,
        chunks_stored: u64,
        db: &SurrealDbClient,
    ) -> Result<IngestJob, AppError> {
        compute_next_status(&self.status, JobTransition::Complete)?;

        const COMPLETE_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            SET status = $completed,
                files_processed = $files_processed,
                chunks_stored = $chunks_stored,
                last_message = $message,
                error = NONE,
                finished_at = $now,
                updated_at = $now
            WHERE status = $running
            RETURN *;
        "#;

        let now = chrono::Utc::now();
        let message = format!("Ingest complete: {files_processed} files, {chunks_stored} chunks");
        let mut result = db
            .query(COMPLETE_QUERY)
            .bind(("table", Self::table_name()))
            .bind(("id", self.id.clone()))
            .bind(("completed", JobStatus::Completed.as_str()))
            .bind(("running", JobStatus::Running.as_str()))
            .bind(("files_processed", files_processed))
            .bind(("chunks_stored", chunks_stored))
            .bind(("message", message))
            .bind(("now", SurrealDatetime::from(now)))
            .await?;

        let updated: Option<IngestJob> = result.take(0)?;
        updated.ok_or_else(|| invalid_transition(&self.status, JobTransition::Complete))
    }

    pub async fn mark_failed(
        &self,
        error_message: &str,
        db: &SurrealDbClient,
    ) -> Result<IngestJob, AppError> {
        const FAIL_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            SET status = $failed,
                error = $error,
                last_message = $error,
                finished_at = $now,
                updated_at = $now
            WHERE status IN $allow_statuses
            RETURN *;
        "#;

        let now = chrono::Utc::now();
        let mut result = db
            .query(FAIL_QUERY)
            .bind(("table", Self::table_name()))
            .bind(("id", self.id.clone()))
            .bind(("failed", JobStatus::Failed.as_str()))
            .bind(("error", error_message.to_string()))
            .bind((
                "allow_statuses",
                vec![
                    JobStatus::Queued.as_str(),
                    JobStatus::Running.as_str(),
                    JobStatus::CancelRequested.as_str(),
                ],
            ))
            .bind(("now", SurrealDatetime::from(now)))
            .await?;

        let updated: Option<IngestJob> = result.take(0)?;
        updated.ok_or_else(|| invalid_transition(&self.status, JobTransition::Fail))
    }

    /// Observes an external cancellation and settles the record. Already
    /// canceled jobs are left untouched.
    pub async fn mark_canceled(&self, db: &SurrealDbClient) -> Result<IngestJob, AppError> {
        if self.status == JobStatus::Canceled {
            return Ok(self.clone());
        }
        compute_next_status(&self.status, JobTransition::Cancel)?;

        const CANCEL_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            SET status = $canceled,
                last_message = $message,
                finished_at = $now,
                updated_at = $now
            WHERE status IN $allow_statuses
            RETURN *;
        "#;

        let now = chrono::Utc::now();
        let mut result = db
            .query(CANCEL_QUERY)
            .bind(("table", Self::table_name()))
            .bind(("id", self.id.clone()))
            .bind(("canceled", JobStatus::Canceled.as_str()))
            .bind(("message", CANCELED_MESSAGE))
            .bind((
                "allow_statuses",
                vec![
                    JobStatus::Queued.as_str(),
                    JobStatus::Running.as_str(),
                    JobStatus::CancelRequested.as_str(),
                ],
            ))
            .bind(("now", SurrealDatetime::from(now)))
            .await?;

        let updated: Option<IngestJob> = result.take(0)?;
        updated.ok_or_else(|| invalid_transition(&self.status, JobTransition::Cancel))
    }

    /// The external actor's entry point: flags a queued or running job for
    /// cooperative cancellation. The pipeline itself never calls this.
    pub async fn request_cancel(
        id: &str,
        db: &SurrealDbClient,
    ) -> Result<Option<IngestJob>, AppError> {
        const REQUEST_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            SET status = $cancel_requested,
                updated_at = $now
            WHERE status IN $allow_statuses
            RETURN *;
        "#;

        let now = chrono::Utc::now();
        let mut result = db
            .query(REQUEST_QUERY)
            .bind(("table", Self::table_name()))
            .bind(("id", id.to_string()))
            .bind(("cancel_requested", JobStatus::CancelRequested.as_str()))
            .bind((
                "allow_statuses",
                vec![JobStatus::Queued.as_str(), JobStatus::Running.as_str()],
            ))
            .bind(("now", SurrealDatetime::from(now)))
            .await?;

        let updated: Option<IngestJob> = result.take(0)?;
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_db() -> SurrealDbClient {
        SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("in-memory surrealdb")
    }

    #[tokio::test]
    async fn new_job_defaults() {
        let job = IngestJob::new("https://github.com/acme/widgets".into(), None, None);

        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.total_files, 0);
        assert_eq!(job.files_processed, 0);
        assert!(job.started_at.is_none());
        assert!(job.finished_at.is_none());
    }

    #[tokio::test]
    async fn full_lifecycle_to_completed() {
        let db = memory_db().await;
        let job = IngestJob::create_and_store(
            "https://github.com/acme/widgets".into(),
            None,
            None,
            &db,
        )
        .await
        .expect("create");

        let running = job.mark_running(&db).await.expect("running");
        assert_eq!(running.status, JobStatus::Running);
        assert!(running.started_at.is_some());

        running
            .record_totals(4, 2_048, "Selected 4 files".into(), &db)
            .await
            .expect("totals");
        running
            .record_progress(2, 10, "Processed 2/4 files".into(), &db)
            .await
            .expect("progress");

        let completed = running.mark_completed(4, 20, &db).await.expect("completed");
        assert_eq!(completed.status, JobStatus::Completed);
        assert_eq!(completed.files_processed, 4);
        assert_eq!(completed.chunks_stored, 20);
        assert_eq!(completed.total_files, 4);
        assert!(completed.finished_at.is_some());
        assert!(completed.error.is_none());
    }

    #[tokio::test]
    async fn failed_jobs_record_the_error() {
        let db = memory_db().await;
        let job = IngestJob::create_and_store("not a url".into(), None, None, &db)
            .await
            .expect("create");

        let running = job.mark_running(&db).await.expect("running");
        let failed = running
            .mark_failed("Invalid repository URL", &db)
            .await
            .expect("failed");

        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("Invalid repository URL"));
        assert!(failed.finished_at.is_some());
    }

    #[tokio::test]
    async fn cancel_request_then_observation() {
        let db = memory_db().await;
        let job = IngestJob::create_and_store(
            "https://github.com/acme/widgets".into(),
            None,
            None,
            &db,
        )
        .await
        .expect("create");
        let running = job.mark_running(&db).await.expect("running");

        let requested = IngestJob::request_cancel(&running.id, &db)
            .await
            .expect("request")
            .expect("job updated");
        assert_eq!(requested.status, JobStatus::CancelRequested);

        let status = IngestJob::current_status(&running.id, &db)
            .await
            .expect("status");
        assert_eq!(status, Some(JobStatus::CancelRequested));

        let canceled = requested.mark_canceled(&db).await.expect("canceled");
        assert_eq!(canceled.status, JobStatus::Canceled);
        assert_eq!(canceled.last_message.as_deref(), Some(CANCELED_MESSAGE));
    }

    #[tokio::test]
    async fn completed_jobs_cannot_be_cancel_requested() {
        let db = memory_db().await;
        let job = IngestJob::create_and_store(
            "https://github.com/acme/widgets".into(),
            None,
            None,
            &db,
        )
        .await
        .expect("create");
        let running = job.mark_running(&db).await.expect("running");
        let completed = running.mark_completed(0, 0, &db).await.expect("completed");

        let request = IngestJob::request_cancel(&completed.id, &db)
            .await
            .expect("request");
        assert!(request.is_none());
    }

    #[test]
    fn transition_table_rejects_invalid_moves() {
        assert!(compute_next_status(&JobStatus::Completed, JobTransition::Start).is_err());
        assert!(compute_next_status(&JobStatus::Canceled, JobTransition::Complete).is_err());
        assert!(
            compute_next_status(&JobStatus::CancelRequested, JobTransition::Cancel).is_ok()
        );
    }
}
