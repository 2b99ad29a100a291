//! Retrying HTTP fetcher for the source-control server.
//!
//! [`Fetcher::fetch`] performs one logical "fetch one page" call. It owns
//! retry and backoff for transient failures and classifies everything else
//! into a terminal outcome:
//!
//! | status          | outcome                                   |
//! |-----------------|-------------------------------------------|
//! | 2xx             | [`FetchOutcome::Success`]                 |
//! | 404             | [`FetchOutcome::NotFound`], no retry      |
//! | 403             | [`HarvesterError::Forbidden`], no retry   |
//! | 408, 429, 5xx   | backoff and retry                         |
//! | anything else   | [`HarvesterError::UnexpectedStatus`]      |

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method};
use url::Url;

use crate::config::{DEFAULT_BACKOFF_BASE_MS, DEFAULT_MAX_RETRIES, MAX_BACKOFF_SECS};
use crate::error::{HarvesterError, Result};
use crate::stats::HarvestStats;
use crate::types::Record;

/// User agent string identifying this harvester.
const USER_AGENT: &str = concat!("inventory-harvester/", env!("CARGO_PKG_VERSION"));

/// Retry behaviour for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,

    /// Backoff unit; the n-th retry waits `base_delay * 2^n`.
    pub base_delay: Duration,

    /// Cap for a single backoff sleep.
    pub max_delay: Duration,

    /// Retry transient failures of non-idempotent methods too.
    pub retry_non_idempotent: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: Duration::from_millis(DEFAULT_BACKOFF_BASE_MS),
            max_delay: Duration::from_secs(MAX_BACKOFF_SECS),
            retry_non_idempotent: false,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            ..Self::default()
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn allow_non_idempotent_retries(mut self) -> Self {
        self.retry_non_idempotent = true;
        self
    }

    /// Sleep before retry number `attempt + 1`.
    ///
    /// # Examples
    /// ```
    /// use std::time::Duration;
    /// use inventory_harvester::http::RetryPolicy;
    ///
    /// let policy = RetryPolicy::new(5, Duration::from_secs(1));
    /// assert_eq!(policy.delay_for(0), Duration::from_secs(1));
    /// assert_eq!(policy.delay_for(4), Duration::from_secs(16));
    /// ```
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Total time slept when every attempt fails transiently.
    #[must_use]
    pub fn total_backoff(&self) -> Duration {
        (0..self.max_retries).map(|attempt| self.delay_for(attempt)).sum()
    }
}

/// One request descriptor, rebuilt for every page.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: Url,
    pub method: Method,
    pub retry: RetryPolicy,
}

impl FetchRequest {
    pub fn get(url: Url, retry: RetryPolicy) -> Self {
        Self {
            url,
            method: Method::GET,
            retry,
        }
    }

    /// Same request against a different URL (e.g. the next page).
    #[must_use]
    pub fn with_url(&self, url: Url) -> Self {
        Self {
            url,
            method: self.method.clone(),
            retry: self.retry.clone(),
        }
    }

    fn may_retry(&self) -> bool {
        self.method.is_idempotent() || self.retry.retry_non_idempotent
    }
}

/// Status, headers and body of one HTTP response.
#[derive(Debug, Clone, Default)]
pub struct RawResponse {
    pub status: u16,
    /// Header names are lowercase.
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl RawResponse {
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Seconds from a `Retry-After` header, when present and numeric.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        self.header("retry-after")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
    }
}

/// A transport-level failure (no HTTP status available).
#[derive(Debug, Clone)]
pub struct TransportFailure {
    /// Connection resets and timeouts are worth retrying.
    pub transient: bool,
    pub message: String,
}

/// Sends a single HTTP request. Implemented over reqwest in production and
/// by scripted fakes in tests.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        method: &Method,
        url: &Url,
        credential: &str,
    ) -> std::result::Result<RawResponse, TransportFailure>;
}

/// Create a configured HTTP client.
///
/// # Returns
/// A `reqwest::Client` configured with the per-call timeout and user agent.
pub fn create_client(timeout: Duration) -> Result<Client> {
    let client = Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()?;
    Ok(client)
}

/// [`Transport`] backed by a shared `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: create_client(timeout)?,
        })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(
        &self,
        method: &Method,
        url: &Url,
        credential: &str,
    ) -> std::result::Result<RawResponse, TransportFailure> {
        // Personal access tokens go in the password slot with an empty user.
        let response = self
            .client
            .request(method.clone(), url.clone())
            .basic_auth("", Some(credential))
            .header("accept", "application/json")
            .send()
            .await
            .map_err(|e| TransportFailure {
                transient: e.is_connect() || e.is_timeout() || e.is_request(),
                message: e.to_string(),
            })?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();

        let body = response.bytes().await.map_err(|e| TransportFailure {
            transient: e.is_timeout() || e.is_body(),
            message: e.to_string(),
        })?;

        Ok(RawResponse {
            status,
            headers,
            body: body.to_vec(),
        })
    }
}

/// Classification of an HTTP status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    NotFound,
    Forbidden,
    Transient,
    Other,
}

impl StatusClass {
    #[must_use]
    pub fn of(status: u16) -> Self {
        match status {
            200..=299 => Self::Success,
            404 => Self::NotFound,
            403 => Self::Forbidden,
            408 | 429 | 500..=599 => Self::Transient,
            _ => Self::Other,
        }
    }
}

/// Result of a fetch that did not fail.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Success(RawResponse),
    /// 404: the resource does not exist; callers treat it as empty.
    NotFound,
}

/// Retrying fetcher bound to one server credential.
#[derive(Clone)]
pub struct Fetcher {
    transport: Arc<dyn Transport>,
    credential: String,
    stats: Arc<HarvestStats>,
}

impl Fetcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        credential: impl Into<String>,
        stats: Arc<HarvestStats>,
    ) -> Self {
        Self {
            transport,
            credential: credential.into(),
            stats,
        }
    }

    pub fn stats(&self) -> &Arc<HarvestStats> {
        &self.stats
    }

    /// Fetch one page, retrying transient failures with exponential backoff.
    ///
    /// # Errors
    /// `Forbidden` on 403, `UnexpectedStatus` on codes outside the retry
    /// taxonomy (or transient codes of non-retryable methods), `Transport`
    /// on non-transient transport errors and `RetriesExhausted` once every
    /// attempt failed transiently.
    pub async fn fetch(&self, request: &FetchRequest) -> Result<FetchOutcome> {
        let url = request.url.as_str();
        let max_attempts = request.retry.max_retries.saturating_add(1);
        let mut last_error = String::new();
        let mut next_delay = Duration::ZERO;

        for attempt in 0..max_attempts {
            if attempt > 0 {
                tracing::debug!(
                    url,
                    attempt,
                    delay_ms = next_delay.as_millis() as u64,
                    "Retrying after delay"
                );
                tokio::time::sleep(next_delay).await;
                self.stats.record_retry();
            }
            self.stats.record_request();

            match self
                .transport
                .send(&request.method, &request.url, &self.credential)
                .await
            {
                Ok(response) => {
                    let status = response.status;
                    match StatusClass::of(status) {
                        StatusClass::Success => return Ok(FetchOutcome::Success(response)),
                        StatusClass::NotFound => {
                            tracing::debug!(url, status, "Resource not found, treating as empty");
                            return Ok(FetchOutcome::NotFound);
                        }
                        StatusClass::Forbidden => {
                            tracing::error!(url, status, "Access forbidden");
                            return Err(HarvesterError::Forbidden {
                                url: url.to_string(),
                            });
                        }
                        StatusClass::Transient if request.may_retry() => {
                            next_delay = request.retry.delay_for(attempt);
                            if let Some(retry_after) = response.retry_after() {
                                next_delay =
                                    next_delay.max(retry_after.min(request.retry.max_delay));
                            }
                            tracing::warn!(
                                url,
                                status,
                                attempt = attempt + 1,
                                max_attempts,
                                "Transient server response, will retry"
                            );
                            last_error = format!("HTTP {status}");
                        }
                        StatusClass::Transient | StatusClass::Other => {
                            tracing::error!(url, status, method = %request.method, "Request failed");
                            return Err(HarvesterError::UnexpectedStatus {
                                url: url.to_string(),
                                status,
                            });
                        }
                    }
                }
                Err(failure) if failure.transient && request.may_retry() => {
                    next_delay = request.retry.delay_for(attempt);
                    tracing::warn!(
                        url,
                        error = %failure.message,
                        attempt = attempt + 1,
                        max_attempts,
                        "Connection error, will retry"
                    );
                    last_error = failure.message;
                }
                Err(failure) => {
                    tracing::error!(url, error = %failure.message, "Request failed");
                    return Err(HarvesterError::Transport {
                        url: url.to_string(),
                        message: failure.message,
                        transient: failure.transient,
                    });
                }
            }
        }

        tracing::error!(url, attempts = max_attempts, last_error = %last_error, "Retries exhausted");
        Err(HarvesterError::RetriesExhausted {
            url: url.to_string(),
            attempts: max_attempts,
            message: last_error,
        })
    }

    /// Fetch a single JSON object (detail endpoints). `Ok(None)` on 404.
    pub async fn fetch_object(&self, request: &FetchRequest) -> Result<Option<Record>> {
        match self.fetch(request).await? {
            FetchOutcome::NotFound => Ok(None),
            FetchOutcome::Success(response) => {
                let value: serde_json::Value =
                    serde_json::from_slice(&response.body).map_err(|e| HarvesterError::Decode {
                        url: request.url.to_string(),
                        message: e.to_string(),
                    })?;
                match value {
                    serde_json::Value::Object(record) => Ok(Some(record)),
                    _ => Err(HarvesterError::Decode {
                        url: request.url.to_string(),
                        message: "expected a JSON object".to_string(),
                    }),
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Transport that replays a fixed script of responses, then repeats the
    /// last one forever.
    pub struct ScriptedTransport {
        script: Mutex<VecDeque<std::result::Result<RawResponse, TransportFailure>>>,
        last: Mutex<Option<std::result::Result<RawResponse, TransportFailure>>>,
        pub calls: Mutex<Vec<Url>>,
    }

    impl ScriptedTransport {
        pub fn new(script: Vec<std::result::Result<RawResponse, TransportFailure>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                last: Mutex::new(None),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    pub fn status(status: u16) -> std::result::Result<RawResponse, TransportFailure> {
        Ok(RawResponse {
            status,
            ..RawResponse::default()
        })
    }

    pub fn json_page(
        body: serde_json::Value,
        token: Option<&str>,
    ) -> std::result::Result<RawResponse, TransportFailure> {
        let mut headers = BTreeMap::new();
        if let Some(token) = token {
            headers.insert(
                crate::config::CONTINUATION_HEADER.to_string(),
                token.to_string(),
            );
        }
        Ok(RawResponse {
            status: 200,
            headers,
            body: serde_json::to_vec(&body).unwrap(),
        })
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(
            &self,
            _method: &Method,
            url: &Url,
            _credential: &str,
        ) -> std::result::Result<RawResponse, TransportFailure> {
            self.calls.lock().unwrap().push(url.clone());
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(response) => {
                    *self.last.lock().unwrap() = Some(response.clone());
                    response
                }
                None => self
                    .last
                    .lock()
                    .unwrap()
                    .clone()
                    .unwrap_or_else(|| status(500)),
            }
        }
    }

    /// [`ScriptedTransport`] that cancels `cancel` once `after` requests
    /// have been answered.
    pub struct CancelAfter {
        pub inner: ScriptedTransport,
        cancel: tokio_util::sync::CancellationToken,
        after: usize,
    }

    impl CancelAfter {
        pub fn new(
            script: Vec<std::result::Result<RawResponse, TransportFailure>>,
            cancel: tokio_util::sync::CancellationToken,
            after: usize,
        ) -> Self {
            Self {
                inner: ScriptedTransport::new(script),
                cancel,
                after,
            }
        }
    }

    #[async_trait]
    impl Transport for CancelAfter {
        async fn send(
            &self,
            method: &Method,
            url: &Url,
            credential: &str,
        ) -> std::result::Result<RawResponse, TransportFailure> {
            let response = self.inner.send(method, url, credential).await;
            if self.inner.call_count() >= self.after {
                self.cancel.cancel();
            }
            response
        }
    }

    pub fn fetcher(transport: Arc<ScriptedTransport>) -> Fetcher {
        Fetcher::new(transport, "pat", Arc::new(HarvestStats::default()))
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    fn request(max_retries: u32, base: Duration) -> FetchRequest {
        let url = Url::parse("https://tfs.example.com/Main/_apis/projects").unwrap();
        FetchRequest::get(url, RetryPolicy::new(max_retries, base))
    }

    #[test]
    fn test_create_client() {
        let client = create_client(Duration::from_secs(5));
        assert!(client.is_ok());
    }

    #[test]
    fn test_status_classes() {
        assert_eq!(StatusClass::of(200), StatusClass::Success);
        assert_eq!(StatusClass::of(204), StatusClass::Success);
        assert_eq!(StatusClass::of(404), StatusClass::NotFound);
        assert_eq!(StatusClass::of(403), StatusClass::Forbidden);
        assert_eq!(StatusClass::of(408), StatusClass::Transient);
        assert_eq!(StatusClass::of(429), StatusClass::Transient);
        assert_eq!(StatusClass::of(503), StatusClass::Transient);
        assert_eq!(StatusClass::of(400), StatusClass::Other);
        assert_eq!(StatusClass::of(401), StatusClass::Other);
        assert_eq!(StatusClass::of(302), StatusClass::Other);
    }

    #[test]
    fn test_backoff_envelope() {
        let policy = RetryPolicy::new(5, Duration::from_secs(1));
        assert_eq!(policy.total_backoff(), Duration::from_secs(31));
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy::new(40, Duration::from_secs(1)).with_max_delay(Duration::from_secs(60));
        assert_eq!(policy.delay_for(10), Duration::from_secs(60));
        assert_eq!(policy.delay_for(39), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_429_exhausts_retries_within_envelope() {
        let transport = Arc::new(ScriptedTransport::new(vec![status(429)]));
        let fetcher = fetcher(transport.clone());

        let started = tokio::time::Instant::now();
        let err = fetcher
            .fetch(&request(5, Duration::from_secs(1)))
            .await
            .unwrap_err();
        let elapsed = started.elapsed();

        assert!(matches!(err, HarvesterError::RetriesExhausted { attempts: 6, .. }));
        assert_eq!(transport.call_count(), 6);
        assert!(elapsed >= Duration::from_secs(31));
        assert!(elapsed < Duration::from_secs(32));
        assert_eq!(fetcher.stats().snapshot().retries, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_then_success() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            status(503),
            Err(TransportFailure {
                transient: true,
                message: "connection reset".to_string(),
            }),
            json_page(serde_json::json!({"value": []}), None),
        ]));
        let fetcher = fetcher(transport.clone());

        let outcome = fetcher
            .fetch(&request(3, Duration::from_millis(100)))
            .await
            .unwrap();
        assert!(matches!(outcome, FetchOutcome::Success(_)));
        assert_eq!(transport.call_count(), 3);
    }

    #[tokio::test]
    async fn test_not_found_is_terminal_and_empty() {
        let transport = Arc::new(ScriptedTransport::new(vec![status(404)]));
        let fetcher = fetcher(transport.clone());

        let outcome = fetcher
            .fetch(&request(10, Duration::from_secs(1)))
            .await
            .unwrap();
        assert!(matches!(outcome, FetchOutcome::NotFound));
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test]
    async fn test_forbidden_fails_immediately() {
        let transport = Arc::new(ScriptedTransport::new(vec![status(403)]));
        let fetcher = fetcher(transport.clone());

        let err = fetcher
            .fetch(&request(10, Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, HarvesterError::Forbidden { .. }));
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test]
    async fn test_other_status_is_not_retried() {
        let transport = Arc::new(ScriptedTransport::new(vec![status(400)]));
        let fetcher = fetcher(transport.clone());

        let err = fetcher
            .fetch(&request(10, Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            HarvesterError::UnexpectedStatus { status: 400, .. }
        ));
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test]
    async fn test_non_idempotent_request_is_not_retried() {
        let transport = Arc::new(ScriptedTransport::new(vec![status(500)]));
        let fetcher = fetcher(transport.clone());

        let mut post = request(10, Duration::from_secs(1));
        post.method = Method::POST;

        let err = fetcher.fetch(&post).await.unwrap_err();
        assert!(matches!(
            err,
            HarvesterError::UnexpectedStatus { status: 500, .. }
        ));
        assert_eq!(err.kind(), crate::error::FailureKind::TransientServer);
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_idempotent_retry_opt_in() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            status(500),
            json_page(serde_json::json!({"id": "1"}), None),
        ]));
        let fetcher = fetcher(transport.clone());

        let mut post = request(3, Duration::from_millis(10));
        post.method = Method::POST;
        post.retry = post.retry.allow_non_idempotent_retries();

        assert!(fetcher.fetch(&post).await.is_ok());
        assert_eq!(transport.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_lengthens_sleep() {
        let mut limited = RawResponse {
            status: 429,
            ..RawResponse::default()
        };
        limited
            .headers
            .insert("retry-after".to_string(), "7".to_string());
        let transport = Arc::new(ScriptedTransport::new(vec![
            Ok(limited),
            json_page(serde_json::json!({"value": []}), None),
        ]));
        let fetcher = fetcher(transport);

        let started = tokio::time::Instant::now();
        fetcher
            .fetch(&request(3, Duration::from_secs(1)))
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_secs(7));
    }

    #[tokio::test]
    async fn test_fetch_object() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            json_page(serde_json::json!({"commitId": "abc"}), None),
            status(404),
        ]));
        let fetcher = fetcher(transport);

        let record = fetcher
            .fetch_object(&request(0, Duration::ZERO))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record["commitId"], "abc");

        let missing = fetcher
            .fetch_object(&request(0, Duration::ZERO))
            .await
            .unwrap();
        assert!(missing.is_none());
    }
}
