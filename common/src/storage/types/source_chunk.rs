use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

stored_object!(SourceChunk, "source_chunk", {
    source_id: String,
    content: String,
    embedding: Vec<f32>,
    owner: String,
    repo: String,
    ref_name: String,
    path: String,
    chunk_index: u32
});

impl SourceChunk {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source_id: String,
        content: String,
        embedding: Vec<f32>,
        owner: String,
        repo: String,
        ref_name: String,
        path: String,
        chunk_index: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            source_id,
            content,
            embedding,
            owner,
            repo,
            ref_name,
            path,
            chunk_index,
        }
    }

    /// One insert per file's worth of chunks.
    pub async fn insert_batch(
        chunks: Vec<SourceChunk>,
        db: &SurrealDbClient,
    ) -> Result<usize, AppError> {
        let count = chunks.len();
        db.insert_items(chunks).await?;
        Ok(count)
    }

    pub async fn count_for_source(
        source_id: &str,
        db: &SurrealDbClient,
    ) -> Result<usize, AppError> {
        let mut result = db
            .query(format!(
                "SELECT VALUE count() FROM {} WHERE source_id = $source_id GROUP ALL",
                Self::table_name()
            ))
            .bind(("source_id", source_id.to_string()))
            .await?;

        let counts: Vec<usize> = result.take(0)?;
        Ok(counts.into_iter().next().unwrap_or(0))
    }
}
