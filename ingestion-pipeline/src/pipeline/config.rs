use common::utils::config::AppConfig;

/// Per-run resource caps and chunk geometry, snapshotted from configuration
/// when the pipeline is built.
#[derive(Debug, Clone)]
pub struct IngestionLimits {
    pub max_files_per_run: usize,
    pub max_file_bytes: u64,
    pub max_total_bytes: u64,
    pub max_chunks_per_file: usize,
    pub chunk_size_chars: usize,
    pub chunk_overlap_chars: usize,
    pub progress_flush_interval: u64,
}

impl From<&AppConfig> for IngestionLimits {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            max_files_per_run: cfg.max_files_per_run,
            max_file_bytes: cfg.max_file_bytes,
            max_total_bytes: cfg.max_total_bytes,
            max_chunks_per_file: cfg.max_chunks_per_file,
            chunk_size_chars: cfg.chunk_size_chars,
            chunk_overlap_chars: cfg.chunk_overlap_chars,
            progress_flush_interval: cfg.progress_flush_interval.max(1) as u64,
        }
    }
}

/// Retry pacing for failed queue tasks.
#[derive(Debug, Clone)]
pub struct IngestionTuning {
    pub retry_base_delay_secs: u64,
    pub retry_max_delay_secs: u64,
    pub retry_backoff_cap_exponent: u32,
}

impl Default for IngestionTuning {
    fn default() -> Self {
        Self {
            retry_base_delay_secs: 30,
            retry_max_delay_secs: 900,
            retry_backoff_cap_exponent: 5,
        }
    }
}

impl IngestionTuning {
    /// Exponential backoff for the given (1-based) attempt, capped.
    pub fn retry_delay(&self, attempt: u32) -> std::time::Duration {
        let exponent = attempt.saturating_sub(1).min(self.retry_backoff_cap_exponent);
        let factor = 2u64.saturating_pow(exponent);
        let secs = self
            .retry_base_delay_secs
            .saturating_mul(factor)
            .min(self.retry_max_delay_secs);
        std::time::Duration::from_secs(secs)
    }
}
