use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use common::{
    error::AppError,
    storage::store::StorageManager,
    utils::embedding::EmbeddingProvider,
};

use crate::github::{GitBlob, GitTree, GithubClient, RepoMetadata};

/// External effects of an ingestion run, behind a trait so runs are
/// testable without a code host, an embedding backend, or real storage.
#[async_trait]
pub trait PipelineServices: Send + Sync {
    async fn fetch_repo_metadata(&self, owner: &str, repo: &str)
        -> Result<RepoMetadata, AppError>;

    async fn fetch_tree(
        &self,
        owner: &str,
        repo: &str,
        ref_name: &str,
    ) -> Result<GitTree, AppError>;

    async fn fetch_blob(&self, owner: &str, repo: &str, sha: &str) -> Result<GitBlob, AppError>;

    /// Embeds the batch, preserving input order.
    async fn embed_chunks(&self, chunks: Vec<String>) -> Result<Vec<Vec<f32>>, AppError>;

    async fn store_artifact(&self, key: &str, text: &str) -> Result<(), AppError>;
}

pub struct DefaultPipelineServices {
    github: GithubClient,
    embedding_provider: Arc<EmbeddingProvider>,
    storage: StorageManager,
}

impl DefaultPipelineServices {
    pub fn new(
        github: GithubClient,
        embedding_provider: Arc<EmbeddingProvider>,
        storage: StorageManager,
    ) -> Self {
        Self {
            github,
            embedding_provider,
            storage,
        }
    }
}

#[async_trait]
impl PipelineServices for DefaultPipelineServices {
    async fn fetch_repo_metadata(
        &self,
        owner: &str,
        repo: &str,
    ) -> Result<RepoMetadata, AppError> {
        self.github.get_repo(owner, repo).await
    }

    async fn fetch_tree(
        &self,
        owner: &str,
        repo: &str,
        ref_name: &str,
    ) -> Result<GitTree, AppError> {
        self.github.get_tree(owner, repo, ref_name).await
    }

    async fn fetch_blob(&self, owner: &str, repo: &str, sha: &str) -> Result<GitBlob, AppError> {
        self.github.get_blob(owner, repo, sha).await
    }

    async fn embed_chunks(&self, chunks: Vec<String>) -> Result<Vec<Vec<f32>>, AppError> {
        self.embedding_provider.embed_batch(chunks).await
    }

    async fn store_artifact(&self, key: &str, text: &str) -> Result<(), AppError> {
        self.storage
            .put(key, Bytes::from(text.as_bytes().to_vec()))
            .await
    }
}
