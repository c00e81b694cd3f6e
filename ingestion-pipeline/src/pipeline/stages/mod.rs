use common::{
    error::AppError,
    storage::{
        store::artifact_key,
        types::{
            source::{PurgeScope, Source},
            source_chunk::SourceChunk,
        },
    },
};
use state_machines::core::GuardError;
use tracing::{debug, info, instrument, warn};

use crate::{
    chunking::chunk_text,
    github::parse_repo_url,
    selection::{looks_binary, should_include, SelectedFile},
};

use super::{
    context::RunContext,
    state::{Discovered, Finalized, IngestionMachine, Processed, Ready, Selected},
};

/// Resolves the repository coordinates and pulls the full recursive tree.
#[instrument(
    level = "trace",
    skip_all,
    fields(task_id = %ctx.task_id, attempt = ctx.attempt, job_id = %ctx.job.id)
)]
pub async fn discover(
    machine: IngestionMachine<(), Ready>,
    ctx: &mut RunContext<'_>,
) -> Result<IngestionMachine<(), Discovered>, AppError> {
    let (owner, repo) = parse_repo_url(&ctx.repo_url)?;

    let metadata = ctx.services.fetch_repo_metadata(&owner, &repo).await?;
    let ref_name = metadata.default_branch.clone();

    let tree = ctx.services.fetch_tree(&owner, &repo, &ref_name).await?;
    if tree.truncated {
        warn!(
            job_id = %ctx.job.id,
            owner,
            repo,
            "repository tree was truncated by the host; ingest covers the returned entries only"
        );
    }

    info!(
        task_id = %ctx.task_id,
        job_id = %ctx.job.id,
        owner,
        repo,
        ref_name,
        entries = tree.tree.len(),
        "repository tree fetched"
    );

    ctx.owner = owner;
    ctx.repo = repo;
    ctx.ref_name = ref_name;
    ctx.tree = Some(tree);

    machine
        .discover()
        .map_err(|(_, guard)| map_guard_error("discover", &guard))
}

/// Purges the prior snapshot for this repository, then walks the tree and
/// applies the selection rules under the per-run caps.
#[instrument(
    level = "trace",
    skip_all,
    fields(task_id = %ctx.task_id, attempt = ctx.attempt, job_id = %ctx.job.id)
)]
pub async fn select(
    machine: IngestionMachine<(), Discovered>,
    ctx: &mut RunContext<'_>,
) -> Result<IngestionMachine<(), Selected>, AppError> {
    let purge_scope = PurgeScope::Repo {
        owner: ctx.owner.clone(),
        repo: ctx.repo.clone(),
    };
    let purged = Source::purge(&purge_scope, ctx.db).await?;
    if purged > 0 {
        debug!(
            job_id = %ctx.job.id,
            purged_sources = purged,
            "prior ingest snapshot purged"
        );
    }

    let entries = ctx.tree()?.tree.clone();
    let mut selected: Vec<SelectedFile> = Vec::new();
    let mut budgeted_bytes: u64 = 0;

    for entry in &entries {
        ctx.check_cancellation().await?;

        if !entry.is_blob() {
            continue;
        }
        let Some(sha) = entry.sha.clone() else {
            continue;
        };
        if !should_include(&entry.path, entry.size, ctx.limits.max_file_bytes) {
            continue;
        }

        if selected.len() >= ctx.limits.max_files_per_run {
            debug!(
                job_id = %ctx.job.id,
                cap = ctx.limits.max_files_per_run,
                "file-count cap reached; remaining entries skipped"
            );
            break;
        }

        if let Some(size) = entry.size {
            if budgeted_bytes.saturating_add(size) > ctx.limits.max_total_bytes {
                debug!(
                    job_id = %ctx.job.id,
                    cap = ctx.limits.max_total_bytes,
                    "total-byte budget reached; remaining entries skipped"
                );
                break;
            }
            budgeted_bytes = budgeted_bytes.saturating_add(size);
        }

        selected.push(SelectedFile {
            path: entry.path.clone(),
            sha,
            size: entry.size,
        });
    }

    if selected.is_empty() {
        // Deterministic: the tree will not change on a queue retry.
        return Err(AppError::Unrecoverable(
            "No eligible files found to ingest.".to_string(),
        ));
    }

    let total_files = selected.len() as u64;
    ctx.job
        .record_totals(
            total_files,
            budgeted_bytes,
            format!("Selected {total_files} files"),
            ctx.db,
        )
        .await?;

    info!(
        task_id = %ctx.task_id,
        job_id = %ctx.job.id,
        total_files,
        total_bytes = budgeted_bytes,
        "file selection settled"
    );

    ctx.selected = selected;
    ctx.total_bytes = budgeted_bytes;

    machine
        .select()
        .map_err(|(_, guard)| map_guard_error("select", &guard))
}

/// Fetches, chunks, embeds, and persists every selected file, flushing
/// progress to the job record at the configured interval.
#[instrument(
    level = "trace",
    skip_all,
    fields(task_id = %ctx.task_id, attempt = ctx.attempt, job_id = %ctx.job.id)
)]
pub async fn process_files(
    machine: IngestionMachine<(), Selected>,
    ctx: &mut RunContext<'_>,
) -> Result<IngestionMachine<(), Processed>, AppError> {
    let files = std::mem::take(&mut ctx.selected);
    let flush_interval = ctx.limits.progress_flush_interval;

    // `files_processed` holds committed files only; skips never enter it.
    // The visit counter drives the flush cadence.
    let mut visited: u64 = 0;

    for file in &files {
        ctx.check_cancellation().await?;
        visited = visited.saturating_add(1);

        match ingest_one_file(ctx, file).await? {
            FileOutcome::Stored { chunks } => {
                ctx.files_processed = ctx.files_processed.saturating_add(1);
                ctx.chunks_stored = ctx.chunks_stored.saturating_add(chunks);
            }
            FileOutcome::Skipped(reason) => {
                debug!(
                    job_id = %ctx.job.id,
                    path = %file.path,
                    reason,
                    "file skipped after download"
                );
            }
        }

        if visited % flush_interval == 0 {
            ctx.flush_progress(format!("Processed {visited} of {} files", files.len()))
                .await?;
        }
    }

    machine
        .process()
        .map_err(|(_, guard)| map_guard_error("process", &guard))
}

enum FileOutcome {
    Stored { chunks: u64 },
    Skipped(&'static str),
}

async fn ingest_one_file(
    ctx: &mut RunContext<'_>,
    file: &SelectedFile,
) -> Result<FileOutcome, AppError> {
    let blob = ctx
        .services
        .fetch_blob(&ctx.owner, &ctx.repo, &file.sha)
        .await?;
    let bytes = blob.decoded_bytes()?;

    if looks_binary(&bytes) {
        return Ok(FileOutcome::Skipped("binary content"));
    }

    let text = String::from_utf8_lossy(&bytes);
    if text.trim().is_empty() {
        return Ok(FileOutcome::Skipped("empty content"));
    }

    let mut chunks = chunk_text(
        &text,
        ctx.limits.chunk_size_chars,
        ctx.limits.chunk_overlap_chars,
    );
    if chunks.len() > ctx.limits.max_chunks_per_file {
        debug!(
            job_id = %ctx.job.id,
            path = %file.path,
            produced = chunks.len(),
            cap = ctx.limits.max_chunks_per_file,
            "chunk cap applied"
        );
        chunks.truncate(ctx.limits.max_chunks_per_file);
    }
    if chunks.is_empty() {
        return Ok(FileOutcome::Skipped("no chunkable content"));
    }

    let embeddings = ctx.services.embed_chunks(chunks.clone()).await?;

    let key = artifact_key(
        ctx.job.tenant_id.as_deref(),
        ctx.default_tenant,
        &ctx.owner,
        &ctx.repo,
        &ctx.ref_name,
        &file.path,
    );
    ctx.services.store_artifact(&key, &text).await?;

    let source = Source::new(
        ctx.job.project_id.clone(),
        ctx.owner.clone(),
        ctx.repo.clone(),
        ctx.ref_name.clone(),
        file.path.clone(),
    );
    let source_id = source.id.clone();
    ctx.db.store_item(source).await?;

    let records: Vec<SourceChunk> = chunks
        .into_iter()
        .zip(embeddings)
        .enumerate()
        .map(|(index, (content, embedding))| {
            SourceChunk::new(
                source_id.clone(),
                content,
                embedding,
                ctx.owner.clone(),
                ctx.repo.clone(),
                ctx.ref_name.clone(),
                file.path.clone(),
                index as u32,
            )
        })
        .collect();

    let stored = SourceChunk::insert_batch(records, ctx.db).await?;

    Ok(FileOutcome::Stored {
        chunks: stored as u64,
    })
}

/// Final flush: stamps the completed status with the definitive counters.
#[instrument(
    level = "trace",
    skip_all,
    fields(task_id = %ctx.task_id, attempt = ctx.attempt, job_id = %ctx.job.id)
)]
pub async fn finalize(
    machine: IngestionMachine<(), Processed>,
    ctx: &mut RunContext<'_>,
) -> Result<IngestionMachine<(), Finalized>, AppError> {
    ctx.check_cancellation().await?;

    ctx.job = ctx
        .job
        .mark_completed(ctx.files_processed, ctx.chunks_stored, ctx.db)
        .await?;

    info!(
        task_id = %ctx.task_id,
        job_id = %ctx.job.id,
        files_processed = ctx.files_processed,
        chunks_stored = ctx.chunks_stored,
        "ingestion run completed"
    );

    machine
        .finalize()
        .map_err(|(_, guard)| map_guard_error("finalize", &guard))
}

fn map_guard_error(event: &str, guard: &GuardError) -> AppError {
    AppError::InternalError(format!(
        "invalid ingestion transition during {event}: {guard:?}"
    ))
}
