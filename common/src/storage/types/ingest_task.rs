use std::time::Duration;

use chrono::Duration as ChronoDuration;
use state_machines::state_machine;
use surrealdb::sql::Datetime as SurrealDatetime;
use uuid::Uuid;

use crate::{
    error::AppError,
    storage::{db::SurrealDbClient, types::ingest_job::IngestJob},
    stored_object,
};

pub const MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_LEASE_SECS: i64 = 600;
pub const DEFAULT_PRIORITY: i32 = 0;

/// The only task type this worker processes; anything else is ignored.
pub const INGEST_TASK_TYPE: &str = "repo_ingest";

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct TaskPayload {
    pub task_type: String,
    pub repo_url: String,
    pub ingest_job_id: Option<String>,
    pub project_id: Option<String>,
    pub tenant_id: Option<String>,
}

impl TaskPayload {
    pub fn repo_ingest(
        repo_url: String,
        ingest_job_id: Option<String>,
        project_id: Option<String>,
        tenant_id: Option<String>,
    ) -> Self {
        Self {
            task_type: INGEST_TASK_TYPE.to_string(),
            repo_url,
            ingest_job_id,
            project_id,
            tenant_id,
        }
    }

    pub fn is_ingest(&self) -> bool {
        self.task_type == INGEST_TASK_TYPE
    }
}

#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub enum TaskState {
    #[serde(rename = "Pending")]
    #[default]
    Pending,
    #[serde(rename = "Reserved")]
    Reserved,
    #[serde(rename = "Processing")]
    Processing,
    #[serde(rename = "Succeeded")]
    Succeeded,
    #[serde(rename = "Failed")]
    Failed,
    #[serde(rename = "Cancelled")]
    Cancelled,
    #[serde(rename = "DeadLetter")]
    DeadLetter,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "Pending",
            TaskState::Reserved => "Reserved",
            TaskState::Processing => "Processing",
            TaskState::Succeeded => "Succeeded",
            TaskState::Failed => "Failed",
            TaskState::Cancelled => "Cancelled",
            TaskState::DeadLetter => "DeadLetter",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Cancelled | TaskState::DeadLetter
        )
    }
}

#[derive(Debug, Clone, Copy)]
enum TaskTransition {
    Reserve,
    StartProcessing,
    Succeed,
    Fail,
    Cancel,
    DeadLetter,
}

impl TaskTransition {
    fn as_str(&self) -> &'static str {
        match self {
            TaskTransition::Reserve => "reserve",
            TaskTransition::StartProcessing => "start_processing",
            TaskTransition::Succeed => "succeed",
            TaskTransition::Fail => "fail",
            TaskTransition::Cancel => "cancel",
            TaskTransition::DeadLetter => "deadletter",
        }
    }
}

mod lifecycle {
    use super::state_machine;

    state_machine! {
        name: TaskLifecycleMachine,
        initial: Pending,
        states: [Pending, Reserved, Processing, Succeeded, Failed, Cancelled, DeadLetter],
        events {
            reserve {
                transition: { from: Pending, to: Reserved }
                transition: { from: Failed, to: Reserved }
            }
            start_processing {
                transition: { from: Reserved, to: Processing }
            }
            succeed {
                transition: { from: Processing, to: Succeeded }
            }
            fail {
                transition: { from: Processing, to: Failed }
            }
            cancel {
                transition: { from: Pending, to: Cancelled }
                transition: { from: Reserved, to: Cancelled }
                transition: { from: Processing, to: Cancelled }
            }
            deadletter {
                transition: { from: Failed, to: DeadLetter }
            }
        }
    }

    pub(super) fn pending() -> TaskLifecycleMachine<(), Pending> {
        TaskLifecycleMachine::new(())
    }

    pub(super) fn reserved() -> TaskLifecycleMachine<(), Reserved> {
        pending()
            .reserve()
            .expect("reserve transition from Pending should exist")
    }

    pub(super) fn processing() -> TaskLifecycleMachine<(), Processing> {
        reserved()
            .start_processing()
            .expect("start_processing transition from Reserved should exist")
    }

    pub(super) fn failed() -> TaskLifecycleMachine<(), Failed> {
        processing()
            .fail()
            .expect("fail transition from Processing should exist")
    }
}

fn invalid_transition(state: &TaskState, event: TaskTransition) -> AppError {
    AppError::Validation(format!(
        "Invalid task transition: {} -> {}",
        state.as_str(),
        event.as_str()
    ))
}

fn compute_next_state(state: &TaskState, event: TaskTransition) -> Result<TaskState, AppError> {
    use lifecycle::*;
    match (state, event) {
        (TaskState::Pending, TaskTransition::Reserve) => pending()
            .reserve()
            .map(|_| TaskState::Reserved)
            .map_err(|_| invalid_transition(state, event)),
        (TaskState::Failed, TaskTransition::Reserve) => failed()
            .reserve()
            .map(|_| TaskState::Reserved)
            .map_err(|_| invalid_transition(state, event)),
        (TaskState::Reserved, TaskTransition::StartProcessing) => reserved()
            .start_processing()
            .map(|_| TaskState::Processing)
            .map_err(|_| invalid_transition(state, event)),
        (TaskState::Processing, TaskTransition::Succeed) => processing()
            .succeed()
            .map(|_| TaskState::Succeeded)
            .map_err(|_| invalid_transition(state, event)),
        (TaskState::Processing, TaskTransition::Fail) => processing()
            .fail()
            .map(|_| TaskState::Failed)
            .map_err(|_| invalid_transition(state, event)),
        (TaskState::Pending, TaskTransition::Cancel) => pending()
            .cancel()
            .map(|_| TaskState::Cancelled)
            .map_err(|_| invalid_transition(state, event)),
        (TaskState::Reserved, TaskTransition::Cancel) => reserved()
            .cancel()
            .map(|_| TaskState::Cancelled)
            .map_err(|_| invalid_transition(state, event)),
        (TaskState::Processing, TaskTransition::Cancel) => processing()
            .cancel()
            .map(|_| TaskState::Cancelled)
            .map_err(|_| invalid_transition(state, event)),
        (TaskState::Failed, TaskTransition::DeadLetter) => failed()
            .deadletter()
            .map(|_| TaskState::DeadLetter)
            .map_err(|_| invalid_transition(state, event)),
        _ => Err(invalid_transition(state, event)),
    }
}

stored_object!(IngestTask, "ingest_task", {
    payload: TaskPayload,
    state: TaskState,
    attempts: u32,
    max_attempts: u32,
    #[serde(serialize_with = "serialize_datetime", deserialize_with = "deserialize_datetime")]
    scheduled_at: chrono::DateTime<chrono::Utc>,
    #[serde(
        serialize_with = "serialize_option_datetime",
        deserialize_with = "deserialize_option_datetime",
        default
    )]
    locked_at: Option<chrono::DateTime<chrono::Utc>>,
    lease_duration_secs: i64,
    worker_id: Option<String>,
    error_message: Option<String>,
    #[serde(
        serialize_with = "serialize_option_datetime",
        deserialize_with = "deserialize_option_datetime",
        default
    )]
    last_error_at: Option<chrono::DateTime<chrono::Utc>>,
    priority: i32
});

impl IngestTask {
    pub fn new(payload: TaskPayload) -> Self {
        let now = chrono::Utc::now();

        Self {
            id: Uuid::new_v4().to_string(),
            payload,
            state: TaskState::Pending,
            attempts: 0,
            max_attempts: MAX_ATTEMPTS,
            scheduled_at: now,
            locked_at: None,
            lease_duration_secs: DEFAULT_LEASE_SECS,
            worker_id: None,
            error_message: None,
            last_error_at: None,
            priority: DEFAULT_PRIORITY,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_duration_secs.max(0) as u64)
    }

    /// Creates the queue record together with its job-status companion;
    /// the submitting layer gets back both ids.
    pub async fn enqueue(
        repo_url: String,
        project_id: Option<String>,
        tenant_id: Option<String>,
        db: &SurrealDbClient,
    ) -> Result<(IngestTask, IngestJob), AppError> {
        let job = IngestJob::create_and_store(
            repo_url.clone(),
            project_id.clone(),
            tenant_id.clone(),
            db,
        )
        .await?;

        let task = Self::new(TaskPayload::repo_ingest(
            repo_url,
            Some(job.id.clone()),
            project_id,
            tenant_id,
        ));
        db.store_item(task.clone()).await?;

        Ok((task, job))
    }

    /// Atomically claims the next ready task for this worker. Tasks whose
    /// lease has lapsed while Reserved/Processing become claimable again.
    pub async fn claim_next_ready(
        db: &SurrealDbClient,
        worker_id: &str,
        now: chrono::DateTime<chrono::Utc>,
        lease_duration: Duration,
    ) -> Result<Option<IngestTask>, AppError> {
        debug_assert!(compute_next_state(&TaskState::Pending, TaskTransition::Reserve).is_ok());
        debug_assert!(compute_next_state(&TaskState::Failed, TaskTransition::Reserve).is_ok());

        const CLAIM_QUERY: &str = r#"
            UPDATE (
                SELECT * FROM type::table($table)
                WHERE state IN $candidate_states
                  AND scheduled_at <= $now
                  AND (
                        attempts < max_attempts
                        OR state IN $sticky_states
                  )
                  AND (
                        locked_at = NONE
                        OR time::unix($now) - time::unix(locked_at) >= lease_duration_secs
                  )
                ORDER BY priority DESC, scheduled_at ASC, created_at ASC
                LIMIT 1
            )
            SET state = $reserved_state,
                attempts = if state IN $increment_states THEN
                    if attempts + 1 > max_attempts THEN max_attempts ELSE attempts + 1 END
                ELSE
                    attempts
                END,
                locked_at = $now,
                worker_id = $worker_id,
                lease_duration_secs = $lease_secs,
                updated_at = $now
            RETURN *;
        "#;

        let mut result = db
            .client
            .query(CLAIM_QUERY)
            .bind(("table", Self::table_name()))
            .bind((
                "candidate_states",
                vec![
                    TaskState::Pending.as_str(),
                    TaskState::Failed.as_str(),
                    TaskState::Reserved.as_str(),
                    TaskState::Processing.as_str(),
                ],
            ))
            .bind((
                "sticky_states",
                vec![TaskState::Reserved.as_str(), TaskState::Processing.as_str()],
            ))
            .bind((
                "increment_states",
                vec![TaskState::Pending.as_str(), TaskState::Failed.as_str()],
            ))
            .bind(("reserved_state", TaskState::Reserved.as_str()))
            .bind(("now", SurrealDatetime::from(now)))
            .bind(("worker_id", worker_id.to_string()))
            .bind(("lease_secs", lease_duration.as_secs() as i64))
            .await?;

        let task: Option<IngestTask> = result.take(0)?;
        Ok(task)
    }

    pub async fn mark_processing(&self, db: &SurrealDbClient) -> Result<IngestTask, AppError> {
        let next = compute_next_state(&self.state, TaskTransition::StartProcessing)?;
        debug_assert_eq!(next, TaskState::Processing);

        const START_PROCESSING_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            SET state = $processing,
                updated_at = $now,
                locked_at = $now
            WHERE state = $reserved AND worker_id = $worker_id
            RETURN *;
        "#;

        let now = chrono::Utc::now();
        let mut result = db
            .client
            .query(START_PROCESSING_QUERY)
            .bind(("table", Self::table_name()))
            .bind(("id", self.id.clone()))
            .bind(("processing", TaskState::Processing.as_str()))
            .bind(("reserved", TaskState::Reserved.as_str()))
            .bind(("now", SurrealDatetime::from(now)))
            .bind(("worker_id", self.worker_id.clone().unwrap_or_default()))
            .await?;

        let updated: Option<IngestTask> = result.take(0)?;
        updated.ok_or_else(|| invalid_transition(&self.state, TaskTransition::StartProcessing))
    }

    pub async fn mark_succeeded(&self, db: &SurrealDbClient) -> Result<IngestTask, AppError> {
        let next = compute_next_state(&self.state, TaskTransition::Succeed)?;
        debug_assert_eq!(next, TaskState::Succeeded);

        const COMPLETE_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            SET state = $succeeded,
                updated_at = $now,
                locked_at = NONE,
                worker_id = NONE,
                scheduled_at = $now,
                error_message = NONE,
                last_error_at = NONE
            WHERE state = $processing AND worker_id = $worker_id
            RETURN *;
        "#;

        let now = chrono::Utc::now();
        let mut result = db
            .client
            .query(COMPLETE_QUERY)
            .bind(("table", Self::table_name()))
            .bind(("id", self.id.clone()))
            .bind(("succeeded", TaskState::Succeeded.as_str()))
            .bind(("processing", TaskState::Processing.as_str()))
            .bind(("now", SurrealDatetime::from(now)))
            .bind(("worker_id", self.worker_id.clone().unwrap_or_default()))
            .await?;

        let updated: Option<IngestTask> = result.take(0)?;
        updated.ok_or_else(|| invalid_transition(&self.state, TaskTransition::Succeed))
    }

    pub async fn mark_failed(
        &self,
        error_message: &str,
        retry_delay: Duration,
        db: &SurrealDbClient,
    ) -> Result<IngestTask, AppError> {
        let next = compute_next_state(&self.state, TaskTransition::Fail)?;
        debug_assert_eq!(next, TaskState::Failed);

        let now = chrono::Utc::now();
        let retry_at = now
            + ChronoDuration::from_std(retry_delay).unwrap_or_else(|_| ChronoDuration::seconds(30));

        const FAIL_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            SET state = $failed,
                updated_at = $now,
                locked_at = NONE,
                worker_id = NONE,
                scheduled_at = $retry_at,
                error_message = $error_message,
                last_error_at = $now
            WHERE state = $processing AND worker_id = $worker_id
            RETURN *;
        "#;

        let mut result = db
            .client
            .query(FAIL_QUERY)
            .bind(("table", Self::table_name()))
            .bind(("id", self.id.clone()))
            .bind(("failed", TaskState::Failed.as_str()))
            .bind(("processing", TaskState::Processing.as_str()))
            .bind(("now", SurrealDatetime::from(now)))
            .bind(("retry_at", SurrealDatetime::from(retry_at)))
            .bind(("error_message", error_message.to_string()))
            .bind(("worker_id", self.worker_id.clone().unwrap_or_default()))
            .await?;

        let updated: Option<IngestTask> = result.take(0)?;
        updated.ok_or_else(|| invalid_transition(&self.state, TaskTransition::Fail))
    }

    pub async fn mark_dead_letter(
        &self,
        error_message: &str,
        db: &SurrealDbClient,
    ) -> Result<IngestTask, AppError> {
        let next = compute_next_state(&self.state, TaskTransition::DeadLetter)?;
        debug_assert_eq!(next, TaskState::DeadLetter);

        const DEAD_LETTER_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            SET state = $dead,
                updated_at = $now,
                locked_at = NONE,
                worker_id = NONE,
                scheduled_at = $now,
                error_message = $error_message,
                last_error_at = $now
            WHERE state = $failed
            RETURN *;
        "#;

        let now = chrono::Utc::now();
        let mut result = db
            .client
            .query(DEAD_LETTER_QUERY)
            .bind(("table", Self::table_name()))
            .bind(("id", self.id.clone()))
            .bind(("dead", TaskState::DeadLetter.as_str()))
            .bind(("failed", TaskState::Failed.as_str()))
            .bind(("now", SurrealDatetime::from(now)))
            .bind(("error_message", error_message.to_string()))
            .await?;

        let updated: Option<IngestTask> = result.take(0)?;
        updated.ok_or_else(|| invalid_transition(&self.state, TaskTransition::DeadLetter))
    }

    pub async fn mark_cancelled(&self, db: &SurrealDbClient) -> Result<IngestTask, AppError> {
        compute_next_state(&self.state, TaskTransition::Cancel)?;

        const CANCEL_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            SET state = $cancelled,
                updated_at = $now,
                locked_at = NONE,
                worker_id = NONE
            WHERE state IN $allow_states
            RETURN *;
        "#;

        let now = chrono::Utc::now();
        let mut result = db
            .client
            .query(CANCEL_QUERY)
            .bind(("table", Self::table_name()))
            .bind(("id", self.id.clone()))
            .bind(("cancelled", TaskState::Cancelled.as_str()))
            .bind((
                "allow_states",
                vec![
                    TaskState::Pending.as_str(),
                    TaskState::Reserved.as_str(),
                    TaskState::Processing.as_str(),
                ],
            ))
            .bind(("now", SurrealDatetime::from(now)))
            .await?;

        let updated: Option<IngestTask> = result.take(0)?;
        updated.ok_or_else(|| invalid_transition(&self.state, TaskTransition::Cancel))
    }
}
