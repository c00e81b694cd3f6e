use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    sync::Arc,
};

use anyhow::anyhow;
use async_openai::{types::CreateEmbeddingRequestArgs, Client};

use crate::{error::AppError, utils::config::AppConfig};

#[derive(Clone)]
pub struct EmbeddingProvider {
    inner: EmbeddingInner,
}

#[derive(Clone)]
enum EmbeddingInner {
    OpenAI {
        client: Arc<Client<async_openai::config::OpenAIConfig>>,
        model: String,
        dimensions: u32,
    },
    /// Deterministic token-bucket embedding. No network, stable output;
    /// used by tests and local smoke runs.
    Hashed {
        dimension: usize,
    },
}

impl EmbeddingProvider {
    /// Builds the provider the configuration asks for.
    ///
    /// A missing API key for the OpenAI backend is a fatal precondition:
    /// an ingest run cannot produce embeddings without it, so the worker
    /// refuses to start rather than failing per file.
    pub fn from_config(config: &AppConfig) -> Result<Self, AppError> {
        match config.embedding_backend.to_ascii_lowercase().as_str() {
            "openai" => {
                let api_key = config
                    .openai_api_key
                    .as_deref()
                    .filter(|key| !key.trim().is_empty())
                    .ok_or_else(|| {
                        AppError::Validation(
                            "openai_api_key must be configured for the openai embedding backend"
                                .into(),
                        )
                    })?;

                let client = Arc::new(Client::with_config(
                    async_openai::config::OpenAIConfig::new()
                        .with_api_key(api_key)
                        .with_api_base(&config.openai_base_url),
                ));

                Ok(Self::new_openai(
                    client,
                    config.embedding_model.clone(),
                    config.embedding_dimensions,
                ))
            }
            "hashed" => Ok(Self::new_hashed(config.embedding_dimensions as usize)),
            other => Err(AppError::Validation(format!(
                "unknown embedding backend '{other}'. Expected 'openai' or 'hashed'."
            ))),
        }
    }

    pub fn new_openai(
        client: Arc<Client<async_openai::config::OpenAIConfig>>,
        model: String,
        dimensions: u32,
    ) -> Self {
        EmbeddingProvider {
            inner: EmbeddingInner::OpenAI {
                client,
                model,
                dimensions,
            },
        }
    }

    pub fn new_hashed(dimension: usize) -> Self {
        EmbeddingProvider {
            inner: EmbeddingInner::Hashed {
                dimension: dimension.max(1),
            },
        }
    }

    pub fn backend_label(&self) -> &'static str {
        match self.inner {
            EmbeddingInner::Hashed { .. } => "hashed",
            EmbeddingInner::OpenAI { .. } => "openai",
        }
    }

    pub fn dimension(&self) -> usize {
        match &self.inner {
            EmbeddingInner::Hashed { dimension } => *dimension,
            EmbeddingInner::OpenAI { dimensions, .. } => *dimensions as usize,
        }
    }

    /// One embedding per input text, output order matching input order.
    pub async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, AppError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        match &self.inner {
            EmbeddingInner::Hashed { dimension } => Ok(texts
                .iter()
                .map(|text| hashed_embedding(text, *dimension))
                .collect()),
            EmbeddingInner::OpenAI {
                client,
                model,
                dimensions,
            } => {
                let expected = texts.len();
                let request = CreateEmbeddingRequestArgs::default()
                    .model(model.clone())
                    .input(texts)
                    .dimensions(*dimensions)
                    .build()?;

                let response = client.embeddings().create(request).await?;

                let embeddings: Vec<Vec<f32>> = response
                    .data
                    .into_iter()
                    .map(|item| item.embedding)
                    .collect();

                if embeddings.len() != expected {
                    return Err(AppError::Anyhow(anyhow!(
                        "embedding API returned {} vectors for {} inputs",
                        embeddings.len(),
                        expected
                    )));
                }

                Ok(embeddings)
            }
        }
    }
}

fn hashed_embedding(text: &str, dimension: usize) -> Vec<f32> {
    let dim = dimension.max(1);
    let mut vector = vec![0.0f32; dim];
    if text.is_empty() {
        return vector;
    }

    for token in tokens(text) {
        let idx = bucket(&token, dim);
        if let Some(value) = vector.get_mut(idx) {
            *value += 1.0;
        }
    }

    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in &mut vector {
            *value /= norm;
        }
    }

    vector
}

fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(|token| token.to_ascii_lowercase())
}

fn bucket(token: &str, dimension: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    token.hash(&mut hasher);
    (hasher.finish() as usize) % dimension
}
