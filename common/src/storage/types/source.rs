use uuid::Uuid;

use crate::{
    error::AppError,
    storage::{db::SurrealDbClient, types::source_chunk::SourceChunk},
    stored_object,
};

/// Which prior ingest to purge: everything owned by a project, or
/// everything for one owner/repo pair.
#[derive(Debug, Clone)]
pub enum PurgeScope {
    Project(String),
    Repo { owner: String, repo: String },
}

stored_object!(Source, "source", {
    project_id: Option<String>,
    owner: String,
    repo: String,
    ref_type: String,
    ref_name: String,
    path: String,
    url: String
});

impl Source {
    pub fn new(
        project_id: Option<String>,
        owner: String,
        repo: String,
        ref_name: String,
        path: String,
    ) -> Self {
        let now = Utc::now();
        let url = format!("https://github.com/{owner}/{repo}/blob/{ref_name}/{path}");
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            project_id,
            owner,
            repo,
            ref_type: "branch".to_string(),
            ref_name,
            path,
            url,
        }
    }

    /// Removes a prior ingest snapshot. Chunks referencing the matched
    /// sources are deleted before the sources themselves, so an
    /// interruption between the two deletes can never leave a chunk
    /// pointing at a missing source. The source set is re-derived from
    /// the catalog on every call. No-op when nothing matches.
    pub async fn purge(scope: &PurgeScope, db: &SurrealDbClient) -> Result<usize, AppError> {
        let ids = Self::ids_for_scope(scope, db).await?;
        if ids.is_empty() {
            return Ok(0);
        }

        let purged = ids.len();

        db.query(format!(
            "DELETE {} WHERE source_id IN $ids",
            SourceChunk::table_name()
        ))
        .bind(("ids", ids.clone()))
        .await?;

        db.query(format!(
            "DELETE {} WHERE meta::id(id) IN $ids",
            Self::table_name()
        ))
        .bind(("ids", ids))
        .await?;

        Ok(purged)
    }

    async fn ids_for_scope(
        scope: &PurgeScope,
        db: &SurrealDbClient,
    ) -> Result<Vec<String>, AppError> {
        let mut result = match scope {
            PurgeScope::Project(project_id) => {
                db.query(format!(
                    "SELECT VALUE meta::id(id) FROM {} WHERE project_id = $project_id",
                    Self::table_name()
                ))
                .bind(("project_id", project_id.clone()))
                .await?
            }
            PurgeScope::Repo { owner, repo } => {
                db.query(format!(
                    "SELECT VALUE meta::id(id) FROM {} WHERE owner = $owner AND repo = $repo",
                    Self::table_name()
                ))
                .bind(("owner", owner.clone()))
                .bind(("repo", repo.clone()))
                .await?
            }
        };

        let ids: Vec<String> = result.take(0)?;
        Ok(ids)
    }
}
