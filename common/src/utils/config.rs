use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Clone, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Local,
    Memory,
    S3,
}

fn default_storage_kind() -> StorageKind {
    StorageKind::Local
}

#[derive(Clone, Deserialize, Debug)]
pub struct AppConfig {
    pub surrealdb_address: String,
    pub surrealdb_username: String,
    pub surrealdb_password: String,
    pub surrealdb_namespace: String,
    pub surrealdb_database: String,

    /// Required for the OpenAI embedding backend; the worker refuses to
    /// start an ingest run without it.
    #[serde(default)]
    pub openai_api_key: Option<String>,
    #[serde(default = "default_base_url")]
    pub openai_base_url: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_embedding_dimensions")]
    pub embedding_dimensions: u32,
    #[serde(default = "default_embedding_backend")]
    pub embedding_backend: String,

    // Code host credentials. A static token always wins over the app flow.
    #[serde(default)]
    pub github_token: Option<String>,
    #[serde(default)]
    pub github_app_id: Option<String>,
    #[serde(default)]
    pub github_app_private_key: Option<String>,
    #[serde(default)]
    pub github_app_installation_id: Option<u64>,
    #[serde(default = "default_github_api_base")]
    pub github_api_base: String,

    #[serde(default = "default_storage_kind")]
    pub storage: StorageKind,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default)]
    pub s3_endpoint: Option<String>,
    #[serde(default)]
    pub s3_bucket: Option<String>,
    #[serde(default = "default_s3_region")]
    pub s3_region: String,
    #[serde(default)]
    pub s3_access_key_id: Option<String>,
    #[serde(default)]
    pub s3_secret_access_key: Option<String>,

    #[serde(default = "default_tenant_id")]
    pub default_tenant_id: String,

    // Per-run ingestion caps.
    #[serde(default = "default_max_files_per_run")]
    pub max_files_per_run: usize,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    #[serde(default = "default_max_total_bytes")]
    pub max_total_bytes: u64,
    #[serde(default = "default_max_chunks_per_file")]
    pub max_chunks_per_file: usize,
    #[serde(default = "default_progress_flush_interval")]
    pub progress_flush_interval: usize,
    #[serde(default = "default_chunk_size_chars")]
    pub chunk_size_chars: usize,
    #[serde(default = "default_chunk_overlap_chars")]
    pub chunk_overlap_chars: usize,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_embedding_dimensions() -> u32 {
    1536
}

fn default_embedding_backend() -> String {
    "openai".to_string()
}

fn default_github_api_base() -> String {
    "https://api.github.com".to_string()
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_s3_region() -> String {
    "us-east-1".to_string()
}

fn default_tenant_id() -> String {
    "default".to_string()
}

fn default_max_files_per_run() -> usize {
    500
}

fn default_max_file_bytes() -> u64 {
    500_000
}

fn default_max_total_bytes() -> u64 {
    20_000_000
}

fn default_max_chunks_per_file() -> usize {
    256
}

fn default_progress_flush_interval() -> usize {
    5
}

fn default_chunk_size_chars() -> usize {
    1_200
}

fn default_chunk_overlap_chars() -> usize {
    200
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            surrealdb_address: "mem://".to_string(),
            surrealdb_username: "root".to_string(),
            surrealdb_password: "root".to_string(),
            surrealdb_namespace: "ingest".to_string(),
            surrealdb_database: "ingest".to_string(),
            openai_api_key: None,
            openai_base_url: default_base_url(),
            embedding_model: default_embedding_model(),
            embedding_dimensions: default_embedding_dimensions(),
            embedding_backend: default_embedding_backend(),
            github_token: None,
            github_app_id: None,
            github_app_private_key: None,
            github_app_installation_id: None,
            github_api_base: default_github_api_base(),
            storage: default_storage_kind(),
            data_dir: default_data_dir(),
            s3_endpoint: None,
            s3_bucket: None,
            s3_region: default_s3_region(),
            s3_access_key_id: None,
            s3_secret_access_key: None,
            default_tenant_id: default_tenant_id(),
            max_files_per_run: default_max_files_per_run(),
            max_file_bytes: default_max_file_bytes(),
            max_total_bytes: default_max_total_bytes(),
            max_chunks_per_file: default_max_chunks_per_file(),
            progress_flush_interval: default_progress_flush_interval(),
            chunk_size_chars: default_chunk_size_chars(),
            chunk_overlap_chars: default_chunk_overlap_chars(),
        }
    }
}

pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(Environment::default())
        .build()?;

    config.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = AppConfig::default();

        assert!(config.max_files_per_run > 0);
        assert!(config.chunk_overlap_chars < config.chunk_size_chars);
        assert!(config.progress_flush_interval >= 1);
        assert_eq!(config.storage, StorageKind::Local);
    }
}
