//! Paginated accumulation: drives the [`Fetcher`] through every page of a
//! listing and merges the pages into one deduplicated, first-seen-ordered
//! collection.

use std::collections::HashMap;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::{CONTINUATION_HEADER, MAX_REPEATED_TOKENS};
use crate::error::{HarvesterError, Result};
use crate::http::{FetchOutcome, FetchRequest, Fetcher, RawResponse};
use crate::resource::with_continuation;
use crate::types::{Page, Record, RecordKind};

/// Turns one HTTP response into a [`Page`].
pub type PageExtractor = fn(&RawResponse, &Url) -> Result<Page>;

/// Computes the identity key of a record.
pub type IdentityFn = fn(&Record) -> Option<String>;

/// Default extractor: `{"value": [...]}` body plus the continuation header.
///
/// An empty body is an empty page.
pub fn extract_value_page(response: &RawResponse, url: &Url) -> Result<Page> {
    let continuation_token = response
        .header(CONTINUATION_HEADER)
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(String::from);

    if response.body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Page {
            items: Vec::new(),
            continuation_token,
        });
    }

    let decode_error = |message: String| HarvesterError::Decode {
        url: url.to_string(),
        message,
    };

    let body: Value =
        serde_json::from_slice(&response.body).map_err(|e| decode_error(e.to_string()))?;
    let values = match body {
        Value::Object(mut object) => match object.remove("value") {
            Some(Value::Array(values)) => values,
            Some(_) => return Err(decode_error("'value' is not an array".to_string())),
            None => return Err(decode_error("missing 'value' array".to_string())),
        },
        Value::Array(values) => values,
        _ => return Err(decode_error("expected a JSON object".to_string())),
    };

    let items = values
        .into_iter()
        .filter_map(|v| match v {
            Value::Object(record) => Some(record),
            _ => None,
        })
        .collect();

    Ok(Page {
        items,
        continuation_token,
    })
}

/// Order-preserving set of records keyed by identity.
///
/// Records without an identity key cannot be proven duplicates and are kept.
#[derive(Debug)]
pub struct Deduplicator {
    identity: Identity,
    /// Identity key to index in `records`.
    seen: HashMap<String, usize>,
    records: Vec<Record>,
    keyless: usize,
}

#[derive(Clone, Copy)]
enum Identity {
    Kind(RecordKind),
    Custom(IdentityFn),
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Kind(kind) => write!(f, "Identity::Kind({kind})"),
            Self::Custom(_) => f.write_str("Identity::Custom"),
        }
    }
}

impl Identity {
    fn key(&self, record: &Record) -> Option<String> {
        match self {
            Self::Kind(kind) => kind.identity(record),
            Self::Custom(f) => f(record),
        }
    }
}

impl Deduplicator {
    pub fn new(kind: RecordKind) -> Self {
        Self::with_identity(Identity::Kind(kind))
    }

    pub fn custom(identity: IdentityFn) -> Self {
        Self::with_identity(Identity::Custom(identity))
    }

    fn with_identity(identity: Identity) -> Self {
        Self {
            identity,
            seen: HashMap::new(),
            records: Vec::new(),
            keyless: 0,
        }
    }

    /// Add a record; returns `false` when its identity was already seen.
    pub fn push(&mut self, record: Record) -> bool {
        match self.identity.key(&record) {
            Some(key) => {
                if self.seen.contains_key(&key) {
                    return false;
                }
                self.seen.insert(key, self.records.len());
            }
            None => self.keyless += 1,
        }
        self.records.push(record);
        true
    }

    /// Add every record of a page; returns `(added, duplicates)`.
    pub fn extend(&mut self, records: impl IntoIterator<Item = Record>) -> (usize, usize) {
        let mut added = 0;
        let mut duplicates = 0;
        for record in records {
            if self.push(record) {
                added += 1;
            } else {
                duplicates += 1;
            }
        }
        (added, duplicates)
    }

    /// Index of the record with this identity key, if present.
    pub fn position(&self, key: &str) -> Option<usize> {
        self.seen.get(key).copied()
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Record> {
        self.records.get_mut(index)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.seen.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn keyless(&self) -> usize {
        self.keyless
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn into_records(self) -> Vec<Record> {
        self.records
    }
}

/// The continuation token stopped advancing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaginationAnomaly {
    pub url: String,
    pub token: String,
    pub repeats: u32,
}

/// Deduplicated result of one paginated listing.
#[derive(Debug, Default)]
pub struct Accumulated {
    /// Unique records in first-seen order.
    pub records: Vec<Record>,

    /// Pages successfully fetched.
    pub pages: usize,

    /// Records without an identity key.
    pub keyless: usize,

    /// Pagination stopped before the listing was exhausted.
    pub truncated: bool,

    /// The first page returned 404.
    pub not_found: bool,

    /// Set when pagination was abandoned because the token repeated.
    pub anomaly: Option<PaginationAnomaly>,

    /// Terminal failure that stopped pagination.
    pub failure: Option<HarvesterError>,
}

impl Accumulated {
    /// Every page was fetched.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        !self.truncated
    }

    /// Convert to a plain result: complete (or merely anomalous) results are
    /// `Ok`, a failed listing is `Err`.
    pub fn into_result(self) -> Result<Vec<Record>> {
        match self.failure {
            Some(err) => Err(err),
            None => Ok(self.records),
        }
    }
}

/// Paginated fetch primitive, parameterized by page extraction and
/// record identity.
pub struct Paginator<'a> {
    fetcher: &'a Fetcher,
    identity: Identity,
    extract: PageExtractor,
    cancel: Option<&'a CancellationToken>,
    max_repeated_tokens: u32,
}

impl<'a> Paginator<'a> {
    pub fn new(fetcher: &'a Fetcher, kind: RecordKind) -> Self {
        Self {
            fetcher,
            identity: Identity::Kind(kind),
            extract: extract_value_page,
            cancel: None,
            max_repeated_tokens: MAX_REPEATED_TOKENS,
        }
    }

    pub fn with_identity(mut self, identity: IdentityFn) -> Self {
        self.identity = Identity::Custom(identity);
        self
    }

    pub fn with_extractor(mut self, extract: PageExtractor) -> Self {
        self.extract = extract;
        self
    }

    pub fn with_cancellation(mut self, cancel: &'a CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_max_repeated_tokens(mut self, max: u32) -> Self {
        self.max_repeated_tokens = max.max(1);
        self
    }

    /// Fetch every page starting at `request`.
    ///
    /// Never fails outright: terminal errors end pagination and are
    /// reported through [`Accumulated::failure`] together with everything
    /// gathered so far.
    pub async fn collect(&self, request: FetchRequest) -> Accumulated {
        let mut result = Accumulated::default();
        let mut dedup = Deduplicator::with_identity(self.identity);
        let mut request = request;
        let mut last_token: Option<String> = None;
        let mut repeats = 0u32;

        loop {
            if self.cancel.is_some_and(CancellationToken::is_cancelled) {
                tracing::info!(url = %request.url, pages = result.pages, "Pagination cancelled");
                result.truncated = true;
                result.failure = Some(HarvesterError::Cancelled(request.url.to_string()));
                break;
            }

            let response = match self.fetcher.fetch(&request).await {
                Ok(FetchOutcome::Success(response)) => response,
                Ok(FetchOutcome::NotFound) => {
                    if result.pages == 0 {
                        result.not_found = true;
                    } else {
                        // The listing vanished mid-way; keep what we have.
                        tracing::warn!(url = %request.url, pages = result.pages, "Listing disappeared during pagination");
                        result.truncated = true;
                    }
                    break;
                }
                Err(err) => {
                    tracing::warn!(url = %request.url, pages = result.pages, error = %err, "Pagination stopped by terminal failure");
                    result.truncated = true;
                    result.failure = Some(err);
                    break;
                }
            };

            let page = match (self.extract)(&response, &request.url) {
                Ok(page) => page,
                Err(err) => {
                    tracing::warn!(url = %request.url, error = %err, "Could not decode page");
                    result.truncated = true;
                    result.failure = Some(err);
                    break;
                }
            };

            // Append before looking at the token so no fetched item is lost.
            result.pages += 1;
            let (added, duplicates) = dedup.extend(page.items);
            self.fetcher.stats().record_page(added, duplicates);

            let Some(token) = page.continuation_token else {
                break;
            };

            if last_token.as_deref() == Some(token.as_str()) {
                repeats += 1;
                if repeats >= self.max_repeated_tokens {
                    tracing::warn!(
                        url = %request.url,
                        token = %token,
                        repeats,
                        "Continuation token is not advancing, stopping pagination"
                    );
                    result.truncated = true;
                    result.anomaly = Some(PaginationAnomaly {
                        url: request.url.to_string(),
                        token,
                        repeats,
                    });
                    break;
                }
            } else {
                repeats = 0;
            }

            request = request.with_url(with_continuation(&request.url, &token));
            last_token = Some(token);
        }

        result.keyless = dedup.keyless();
        result.records = dedup.into_records();
        result
    }
}
