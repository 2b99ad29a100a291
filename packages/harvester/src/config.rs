//! Configuration constants and run options for the harvester.

use std::time::Duration;

use crate::http::RetryPolicy;

/// REST API version sent with every request.
///
/// 5.0 is the oldest version that exposes every endpoint the crawl needs
/// (annotated tags in particular) on on-premises servers.
pub const DEFAULT_API_VERSION: &str = "5.0";

/// Response header carrying the continuation token of a paginated listing.
pub const CONTINUATION_HEADER: &str = "x-ms-continuationtoken";

/// Query parameter used to echo a continuation token back to the server.
pub const CONTINUATION_PARAM: &str = "continuationToken";

/// Per-call HTTP timeout in seconds.
///
/// Large recursive item listings on busy servers routinely take minutes.
pub const HTTP_TIMEOUT_SECS: u64 = 300;

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 10;

/// Default base unit for exponential backoff (milliseconds).
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 1000;

/// Upper bound for a single backoff sleep (seconds).
pub const MAX_BACKOFF_SECS: u64 = 300;

/// Consecutive pages allowed to repeat the same continuation token before
/// pagination is abandoned.
pub const MAX_REPEATED_TOKENS: u32 = 3;

/// Default number of repositories crawled concurrently.
///
/// Sized for rate-limit headroom on a shared server, not for CPU count.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Options for one harvest run.
#[derive(Debug, Clone)]
pub struct HarvestOptions {
    /// Repositories crawled concurrently.
    pub concurrency: usize,

    /// Retry policy applied to every GET.
    pub retry: RetryPolicy,

    /// Per-call HTTP timeout.
    pub request_timeout: Duration,

    /// `api-version` query parameter.
    pub api_version: String,
}

impl Default for HarvestOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            retry: RetryPolicy::default(),
            request_timeout: Duration::from_secs(HTTP_TIMEOUT_SECS),
            api_version: DEFAULT_API_VERSION.to_string(),
        }
    }
}

impl HarvestOptions {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_api_version(mut self, api_version: impl Into<String>) -> Self {
        self.api_version = api_version.into();
        self
    }
}
