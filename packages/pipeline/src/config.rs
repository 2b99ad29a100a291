use std::path::PathBuf;
use std::time::Duration;

use inventory_harvester::config::{
    DEFAULT_API_VERSION, DEFAULT_BACKOFF_BASE_MS, DEFAULT_CONCURRENCY, DEFAULT_MAX_RETRIES,
    HTTP_TIMEOUT_SECS,
};
use inventory_harvester::http::RetryPolicy;
use inventory_harvester::HarvestOptions;

use crate::error::{PipelineError, Result};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worklist: PathBuf,
    pub output_dir: PathBuf,
    pub concurrency: usize,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub request_timeout: Duration,
    pub api_version: String,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self> {
        let worklist = std::env::var("HARVEST_WORKLIST")
            .map_err(|_| PipelineError::Config("HARVEST_WORKLIST not set".into()))?
            .into();

        let output_dir = std::env::var("HARVEST_OUTPUT_DIR")
            .unwrap_or_else(|_| "./inventory".into())
            .into();

        let concurrency = std::env::var("HARVEST_CONCURRENCY")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_CONCURRENCY);

        let max_retries = std::env::var("HARVEST_MAX_RETRIES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MAX_RETRIES);

        let backoff_base_ms: u64 = std::env::var("HARVEST_BACKOFF_BASE_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_BACKOFF_BASE_MS);

        let timeout_secs: u64 = std::env::var("HARVEST_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(HTTP_TIMEOUT_SECS);

        let api_version =
            std::env::var("HARVEST_API_VERSION").unwrap_or_else(|_| DEFAULT_API_VERSION.into());

        Ok(Self {
            worklist,
            output_dir,
            concurrency,
            max_retries,
            backoff_base: Duration::from_millis(backoff_base_ms),
            request_timeout: Duration::from_secs(timeout_secs),
            api_version,
        })
    }

    pub fn new(worklist: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            worklist: worklist.into(),
            output_dir: output_dir.into(),
            concurrency: DEFAULT_CONCURRENCY,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_base: Duration::from_millis(DEFAULT_BACKOFF_BASE_MS),
            request_timeout: Duration::from_secs(HTTP_TIMEOUT_SECS),
            api_version: DEFAULT_API_VERSION.into(),
        }
    }

    pub fn with_retries(mut self, max_retries: u32, backoff_base: Duration) -> Self {
        self.max_retries = max_retries;
        self.backoff_base = backoff_base;
        self
    }

    pub fn harvest_options(&self) -> HarvestOptions {
        HarvestOptions::default()
            .with_concurrency(self.concurrency)
            .with_retry(RetryPolicy::new(self.max_retries, self.backoff_base))
            .with_request_timeout(self.request_timeout)
            .with_api_version(self.api_version.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_harvest_options_from_config() {
        let config = WorkerConfig::new("work.yaml", "out")
            .with_retries(3, Duration::from_millis(50));
        let options = config.harvest_options();

        assert_eq!(options.concurrency, DEFAULT_CONCURRENCY);
        assert_eq!(options.retry.max_retries, 3);
        assert_eq!(options.retry.base_delay, Duration::from_millis(50));
        assert_eq!(options.api_version, "5.0");
    }
}
