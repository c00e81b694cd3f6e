use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{
            ingest_job::{IngestJob, JobStatus},
            ingest_task::{IngestTask, TaskState},
            source::Source,
            source_chunk::SourceChunk,
        },
    },
};
use uuid::Uuid;

use crate::github::{GitBlob, GitTree, RepoMetadata, TreeItem};

use super::{
    config::{IngestionLimits, IngestionTuning},
    services::PipelineServices,
    IngestionPipeline,
};

const REPO_URL: &str = "https://github.com/acme/widgets";

struct MockServices {
    metadata: RepoMetadata,
    tree: GitTree,
    blobs: HashMap<String, GitBlob>,
    host_calls: Mutex<u64>,
    artifacts: Mutex<Vec<String>>,
    /// When a blob with this sha is fetched, flag the target job for
    /// cancellation first, mimicking an external actor racing the run.
    cancel_on_sha: Option<String>,
    cancel_target: Mutex<Option<(SurrealDbClient, String)>>,
}

impl MockServices {
    fn new(tree_items: Vec<TreeItem>, blobs: Vec<(&str, &str)>) -> Self {
        let blobs = blobs
            .into_iter()
            .map(|(sha, text)| {
                (
                    sha.to_string(),
                    GitBlob {
                        content: text.to_string(),
                        encoding: "utf-8".to_string(),
                    },
                )
            })
            .collect();

        Self {
            metadata: RepoMetadata {
                default_branch: "main".to_string(),
                private: false,
                size: None,
            },
            tree: GitTree {
                tree: tree_items,
                truncated: false,
            },
            blobs,
            host_calls: Mutex::new(0),
            artifacts: Mutex::new(Vec::new()),
            cancel_on_sha: None,
            cancel_target: Mutex::new(None),
        }
    }

    fn with_cancel_on(mut self, sha: &str) -> Self {
        self.cancel_on_sha = Some(sha.to_string());
        self
    }

    fn arm_cancellation(&self, db: SurrealDbClient, job_id: String) {
        if let Ok(mut target) = self.cancel_target.lock() {
            *target = Some((db, job_id));
        }
    }

    fn record_host_call(&self) {
        if let Ok(mut calls) = self.host_calls.lock() {
            *calls = calls.saturating_add(1);
        }
    }

    fn host_call_count(&self) -> u64 {
        self.host_calls.lock().map(|c| *c).unwrap_or(0)
    }

    fn artifact_keys(&self) -> Vec<String> {
        self.artifacts.lock().map(|a| a.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl PipelineServices for MockServices {
    async fn fetch_repo_metadata(
        &self,
        _owner: &str,
        _repo: &str,
    ) -> Result<RepoMetadata, AppError> {
        self.record_host_call();
        Ok(self.metadata.clone())
    }

    async fn fetch_tree(
        &self,
        _owner: &str,
        _repo: &str,
        _ref_name: &str,
    ) -> Result<GitTree, AppError> {
        self.record_host_call();
        Ok(self.tree.clone())
    }

    async fn fetch_blob(
        &self,
        _owner: &str,
        _repo: &str,
        sha: &str,
    ) -> Result<GitBlob, AppError> {
        self.record_host_call();

        if self.cancel_on_sha.as_deref() == Some(sha) {
            let target = self
                .cancel_target
                .lock()
                .map(|t| t.clone())
                .unwrap_or(None);
            if let Some((db, job_id)) = target {
                IngestJob::request_cancel(&job_id, &db)
                    .await
                    .expect("cancel request succeeds");
            }
        }

        self.blobs
            .get(sha)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("blob {sha}")))
    }

    async fn embed_chunks(&self, chunks: Vec<String>) -> Result<Vec<Vec<f32>>, AppError> {
        Ok(chunks.iter().map(|_| vec![0.1; 8]).collect())
    }

    async fn store_artifact(&self, key: &str, _text: &str) -> Result<(), AppError> {
        if let Ok(mut artifacts) = self.artifacts.lock() {
            artifacts.push(key.to_string());
        }
        Ok(())
    }
}

fn blob_entry(path: &str, sha: &str, size: u64) -> TreeItem {
    TreeItem {
        path: path.to_string(),
        kind: "blob".to_string(),
        sha: Some(sha.to_string()),
        size: Some(size),
    }
}

fn tree_entry(path: &str) -> TreeItem {
    TreeItem {
        path: path.to_string(),
        kind: "tree".to_string(),
        sha: None,
        size: None,
    }
}

fn test_limits() -> IngestionLimits {
    IngestionLimits {
        max_files_per_run: 500,
        max_file_bytes: 500_000,
        max_total_bytes: 20_000_000,
        max_chunks_per_file: 256,
        chunk_size_chars: 1200,
        chunk_overlap_chars: 200,
        progress_flush_interval: 1,
    }
}

async fn setup_db() -> SurrealDbClient {
    let database = Uuid::new_v4().to_string();
    let db = SurrealDbClient::memory("pipeline_test", &database)
        .await
        .expect("in-memory surrealdb");
    db.ensure_initialized().await.expect("schema initialized");
    db
}

fn pipeline_with(
    db: &SurrealDbClient,
    limits: IngestionLimits,
    services: Arc<MockServices>,
) -> IngestionPipeline {
    IngestionPipeline::with_services(
        Arc::new(db.clone()),
        limits,
        IngestionTuning::default(),
        "default".to_string(),
        services,
    )
}

async fn enqueue_and_claim(db: &SurrealDbClient) -> (IngestTask, IngestJob) {
    let (task, job) = IngestTask::enqueue(REPO_URL.to_string(), None, None, db)
        .await
        .expect("enqueue");
    let lease = task.lease_duration();
    let claimed = IngestTask::claim_next_ready(db, "worker-test", chrono::Utc::now(), lease)
        .await
        .expect("claim succeeds")
        .expect("task claimed");
    (claimed, job)
}

fn sample_services() -> MockServices {
    MockServices::new(
        vec![
            tree_entry("src"),
            blob_entry("src/lib.rs", "s1", 100),
            blob_entry("README.md", "s2", 80),
            blob_entry("node_modules/left-pad/index.js", "s3", 40),
            blob_entry("assets/logo.png", "s4", 9000),
        ],
        vec![
            ("s1", "pub fn add(a: u32, b: u32) -> u32 { a + b }\n"),
            ("s2", "# Widgets\n\nA sample project.\n"),
        ],
    )
}

#[tokio::test]
async fn happy_path_completes_job_and_persists_catalog() {
    let db = setup_db().await;
    let services = Arc::new(sample_services());
    let pipeline = pipeline_with(&db, test_limits(), services.clone());

    let (task, job) = enqueue_and_claim(&db).await;
    pipeline.process_task(task.clone()).await.expect("run succeeds");

    let stored_task: IngestTask = db
        .get_item(&task.id)
        .await
        .expect("retrieve task")
        .expect("task present");
    assert_eq!(stored_task.state, TaskState::Succeeded);

    let stored_job: IngestJob = db
        .get_item(&job.id)
        .await
        .expect("retrieve job")
        .expect("job present");
    assert_eq!(stored_job.status, JobStatus::Completed);
    assert_eq!(stored_job.total_files, 2);
    assert_eq!(stored_job.files_processed, 2);
    assert!(stored_job.chunks_stored > 0);
    assert!(stored_job.finished_at.is_some());
    assert_eq!(
        stored_job.last_message.as_deref(),
        Some(
            format!(
                "Ingest complete: 2 files, {} chunks",
                stored_job.chunks_stored
            )
            .as_str()
        )
    );

    let sources: Vec<Source> = db.get_all_stored_items().await.expect("sources");
    assert_eq!(sources.len(), 2);

    let chunks: Vec<SourceChunk> = db.get_all_stored_items().await.expect("chunks");
    assert_eq!(chunks.len() as u64, stored_job.chunks_stored);

    let keys = services.artifact_keys();
    assert_eq!(keys.len(), 2);
    assert!(keys
        .iter()
        .all(|k| k.starts_with("tenants/default/repos/acme/widgets/refs/main/files/")));
}

#[tokio::test]
async fn reingest_replaces_prior_snapshot() {
    let db = setup_db().await;
    let services = Arc::new(sample_services());
    let pipeline = pipeline_with(&db, test_limits(), services.clone());

    let (task, _) = enqueue_and_claim(&db).await;
    pipeline.process_task(task).await.expect("first run");

    let (task, job) = enqueue_and_claim(&db).await;
    pipeline.process_task(task).await.expect("second run");

    // Same repo twice: counts stay flat, not doubled.
    let sources: Vec<Source> = db.get_all_stored_items().await.expect("sources");
    assert_eq!(sources.len(), 2);

    let stored_job: IngestJob = db
        .get_item(&job.id)
        .await
        .expect("retrieve job")
        .expect("job present");
    let chunks: Vec<SourceChunk> = db.get_all_stored_items().await.expect("chunks");
    assert_eq!(chunks.len() as u64, stored_job.chunks_stored);
}

#[tokio::test]
async fn cancellation_mid_run_stops_between_files() {
    let db = setup_db().await;
    let services = Arc::new(
        MockServices::new(
            vec![
                blob_entry("a.md", "s1", 50),
                blob_entry("b.md", "s2", 50),
                blob_entry("c.md", "s3", 50),
            ],
            vec![
                ("s1", "first file body"),
                ("s2", "second file body"),
                ("s3", "third file body"),
            ],
        )
        // Flagged while the first blob is in flight; the poll before the
        // second file observes it.
        .with_cancel_on("s1"),
    );
    let pipeline = pipeline_with(&db, test_limits(), services.clone());

    let (task, job) = enqueue_and_claim(&db).await;
    services.arm_cancellation(db.clone(), job.id.clone());

    pipeline
        .process_task(task.clone())
        .await
        .expect("cancellation is not a task failure");

    let stored_task: IngestTask = db
        .get_item(&task.id)
        .await
        .expect("retrieve task")
        .expect("task present");
    assert_eq!(stored_task.state, TaskState::Cancelled);

    let stored_job: IngestJob = db
        .get_item(&job.id)
        .await
        .expect("retrieve job")
        .expect("job present");
    assert_eq!(stored_job.status, JobStatus::Canceled);
    assert_eq!(stored_job.files_processed, 1);
    assert_eq!(stored_job.last_message.as_deref(), Some("Canceled by request"));
    assert!(stored_job.finished_at.is_some());

    // Only the first file made it to the artifact store and catalog.
    let keys = services.artifact_keys();
    assert_eq!(keys.len(), 1);
    assert!(keys.first().is_some_and(|k| k.ends_with("/a.md")));

    let sources: Vec<Source> = db.get_all_stored_items().await.expect("sources");
    assert_eq!(sources.len(), 1);
}

#[tokio::test]
async fn cancel_before_run_touches_no_host_api() {
    let db = setup_db().await;
    let services = Arc::new(sample_services());
    let pipeline = pipeline_with(&db, test_limits(), services.clone());

    let (task, job) = enqueue_and_claim(&db).await;
    IngestJob::request_cancel(&job.id, &db)
        .await
        .expect("cancel request");

    pipeline.process_task(task.clone()).await.expect("run settles");

    let stored_task: IngestTask = db
        .get_item(&task.id)
        .await
        .expect("retrieve task")
        .expect("task present");
    assert_eq!(stored_task.state, TaskState::Cancelled);

    let stored_job: IngestJob = db
        .get_item(&job.id)
        .await
        .expect("retrieve job")
        .expect("job present");
    assert_eq!(stored_job.status, JobStatus::Canceled);

    assert_eq!(services.host_call_count(), 0);
}

#[tokio::test]
async fn no_eligible_files_fails_the_run() {
    let db = setup_db().await;
    let services = Arc::new(MockServices::new(
        vec![
            blob_entry("node_modules/x/index.js", "s1", 40),
            blob_entry("assets/logo.png", "s2", 9000),
        ],
        vec![],
    ));
    let pipeline = pipeline_with(&db, test_limits(), services);

    let (task, job) = enqueue_and_claim(&db).await;
    let err = pipeline
        .process_task(task.clone())
        .await
        .expect_err("run should fail");
    assert!(err.to_string().contains("No eligible files found to ingest."));

    // Deterministic outcome: no retry is scheduled, the task dead-letters
    // on the first attempt and the job settles as failed with the bare
    // message on its error field.
    let stored_task: IngestTask = db
        .get_item(&task.id)
        .await
        .expect("retrieve task")
        .expect("task present");
    assert_eq!(stored_task.state, TaskState::DeadLetter);

    let stored_job: IngestJob = db
        .get_item(&job.id)
        .await
        .expect("retrieve job")
        .expect("job present");
    assert_eq!(stored_job.status, JobStatus::Failed);
    assert_eq!(
        stored_job.error.as_deref(),
        Some("No eligible files found to ingest.")
    );
    assert_eq!(
        stored_job.last_message.as_deref(),
        Some("No eligible files found to ingest.")
    );
    assert!(stored_job.finished_at.is_some());

    let sources: Vec<Source> = db.get_all_stored_items().await.expect("sources");
    assert!(sources.is_empty());
    let chunks: Vec<SourceChunk> = db.get_all_stored_items().await.expect("chunks");
    assert!(chunks.is_empty());
}

#[tokio::test]
async fn total_byte_budget_stops_selection_before_oversized_file() {
    let db = setup_db().await;
    let services = Arc::new(MockServices::new(
        vec![
            blob_entry("a.md", "s1", 500),
            blob_entry("b.md", "s2", 800),
            blob_entry("c.md", "s3", 2_000_000),
        ],
        vec![
            ("s1", "first file body"),
            ("s2", "second file body"),
            ("s3", "third file body"),
        ],
    ));
    let limits = IngestionLimits {
        max_total_bytes: 1_000_000,
        // Per-file cap stays above every declared size so only the total
        // budget is exercised.
        max_file_bytes: 3_000_000,
        ..test_limits()
    };
    let pipeline = pipeline_with(&db, limits, services.clone());

    let (task, job) = enqueue_and_claim(&db).await;
    pipeline.process_task(task).await.expect("run succeeds");

    let stored_job: IngestJob = db
        .get_item(&job.id)
        .await
        .expect("retrieve job")
        .expect("job present");
    assert_eq!(stored_job.status, JobStatus::Completed);
    assert_eq!(stored_job.total_files, 2);
    assert_eq!(stored_job.total_bytes, 1300);
    assert_eq!(stored_job.files_processed, 2);

    let keys = services.artifact_keys();
    assert_eq!(keys.len(), 2);
    assert!(!keys.iter().any(|k| k.ends_with("/c.md")));
}

#[tokio::test]
async fn binary_and_empty_blobs_are_skipped_after_download() {
    let db = setup_db().await;
    let services = Arc::new(MockServices::new(
        vec![
            blob_entry("a.md", "s1", 50),
            blob_entry("fake-text.txt", "s2", 50),
            blob_entry("empty.txt", "s3", 10),
        ],
        vec![
            ("s1", "real text body"),
            ("s2", "payload\x00with a nul byte"),
            ("s3", "   \n  "),
        ],
    ));
    let pipeline = pipeline_with(&db, test_limits(), services.clone());

    let (task, job) = enqueue_and_claim(&db).await;
    pipeline.process_task(task).await.expect("run succeeds");

    let stored_job: IngestJob = db
        .get_item(&job.id)
        .await
        .expect("retrieve job")
        .expect("job present");
    assert_eq!(stored_job.status, JobStatus::Completed);
    // Skipped files are absent from the committed counter.
    assert_eq!(stored_job.files_processed, 1);
    assert_eq!(
        stored_job.last_message.as_deref(),
        Some(
            format!("Ingest complete: 1 files, {} chunks", stored_job.chunks_stored).as_str()
        )
    );

    let sources: Vec<Source> = db.get_all_stored_items().await.expect("sources");
    assert_eq!(sources.len(), 1);
    assert_eq!(services.artifact_keys().len(), 1);
}

#[tokio::test]
async fn chunk_cap_truncates_oversized_files() {
    let db = setup_db().await;
    // 50 chars with width 10 and no overlap yields 5 windows.
    let services = Arc::new(MockServices::new(
        vec![blob_entry("notes.md", "s1", 50)],
        vec![("s1", "abcdefghijklmnopqrstuvwxyz0123456789abcdefghijklmn")],
    ));
    let limits = IngestionLimits {
        chunk_size_chars: 10,
        chunk_overlap_chars: 0,
        max_chunks_per_file: 2,
        ..test_limits()
    };
    let pipeline = pipeline_with(&db, limits, services.clone());

    let (task, job) = enqueue_and_claim(&db).await;
    pipeline.process_task(task).await.expect("run succeeds");

    let stored_job: IngestJob = db
        .get_item(&job.id)
        .await
        .expect("retrieve job")
        .expect("job present");
    assert_eq!(stored_job.status, JobStatus::Completed);
    assert_eq!(stored_job.files_processed, 1);
    assert_eq!(stored_job.chunks_stored, 2);

    // Only the leading windows survive, in order.
    let mut chunks: Vec<SourceChunk> = db.get_all_stored_items().await.expect("chunks");
    chunks.sort_by_key(|c| c.chunk_index);
    let contents: Vec<&str> = chunks.iter().map(|c| c.content.as_str()).collect();
    assert_eq!(contents, vec!["abcdefghij", "klmnopqrst"]);
}
