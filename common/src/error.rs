use async_openai::error::OpenAIError;
use thiserror::Error;

// Core internal errors
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] surrealdb::Error),
    #[error("OpenAI error: {0}")]
    OpenAI(#[from] OpenAIError),
    #[error("Object store error: {0}")]
    ObjectStore(#[from] object_store::Error),
    #[error("Reqwest error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("JWT error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
    #[error("IoError: {0}")]
    Io(#[from] std::io::Error),
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Authorization error: {0}")]
    Auth(String),
    #[error("Rate limited: {0}")]
    RateLimit(String),
    #[error("Code host API error ({status}): {message}")]
    HostApi { status: u16, message: String },
    #[error("Ingestion Processing error: {0}")]
    Processing(String),
    /// Deterministic run failure. Retrying cannot change the outcome, and
    /// the message is stored on the job record verbatim.
    #[error("{0}")]
    Unrecoverable(String),
    #[error("Internal service error: {0}")]
    InternalError(String),
    /// Cooperative-cancellation signal. Never surfaced to callers as a
    /// failure; the job controller maps it to the canceled outcome.
    #[error("Canceled by request")]
    Canceled,
}

impl AppError {
    /// Whether the queue layer may retry a task that failed with this error.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            AppError::Validation(_) | AppError::Unrecoverable(_)
        )
    }
}
