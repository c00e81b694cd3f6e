use std::sync::Arc;

use common::{
    storage::{db::SurrealDbClient, store::StorageManager},
    utils::{config::get_config, embedding::EmbeddingProvider},
};
use ingestion_pipeline::{run_worker_loop, IngestionPipeline};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let config = get_config()?;

    let db = Arc::new(
        SurrealDbClient::new(
            &config.surrealdb_address,
            &config.surrealdb_username,
            &config.surrealdb_password,
            &config.surrealdb_namespace,
            &config.surrealdb_database,
        )
        .await?,
    );
    db.ensure_initialized().await?;

    let storage = StorageManager::new(&config).await?;
    storage.ensure_ready().await?;

    // Fails fast on a missing embedding credential rather than on the
    // first claimed task.
    let embedding_provider = Arc::new(EmbeddingProvider::from_config(&config)?);

    info!(
        storage = ?storage.backend_kind(),
        embedding_backend = embedding_provider.backend_label(),
        "ingestion worker starting"
    );

    let pipeline = Arc::new(IngestionPipeline::new(
        db.clone(),
        &config,
        storage,
        embedding_provider,
    )?);

    run_worker_loop(db, pipeline).await
}
